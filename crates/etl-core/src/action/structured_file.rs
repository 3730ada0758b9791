use super::{Action, ActionBase};
use crate::dates::DateChunk;
use crate::endpoint::{DataEndpoint, JsonFileEndpoint};
use crate::error::{EtlError, Result};
use crate::etl_config::EtlConfiguration;
use crate::options::ActionOptions;
use crate::overseer_options::OverseerOptions;
use crate::pointer::{extract_fragment, is_valid_pointer};
use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;
use tracing::info;

/// Ingestor copying an array of records out of one JSON document into
/// another. `record_pointer` selects the array inside the source document
/// and `fields`, when given, projects each record onto those keys. The
/// destination is replaced when `truncate_destination` is set and appended to
/// otherwise.
pub struct StructuredFileIngestor {
    base: ActionBase,
    record_pointer: String,
    fields: Option<Vec<String>>,
}

impl StructuredFileIngestor {
    pub fn create(options: ActionOptions, config: &EtlConfiguration) -> Result<Box<dyn Action>> {
        Ok(Box::new(StructuredFileIngestor {
            base: ActionBase::new(options, config)?,
            record_pointer: String::new(),
            fields: None,
        }))
    }

    fn json_endpoint<'a>(
        &self,
        role: &str,
        endpoint: Option<&'a Rc<dyn DataEndpoint>>,
    ) -> Result<&'a JsonFileEndpoint> {
        let endpoint = endpoint.ok_or_else(|| EtlError::MissingOptions {
            name: self.base.name().to_string(),
            missing: vec![role.to_string()],
        })?;
        endpoint
            .as_any()
            .downcast_ref::<JsonFileEndpoint>()
            .ok_or_else(|| {
                EtlError::invalid_option(
                    role,
                    format!(
                        "{} endpoint must be of type '{}', got '{}'",
                        role,
                        JsonFileEndpoint::TYPE,
                        endpoint.endpoint_type()
                    ),
                )
            })
    }

    fn select_records(&self, document: &Value) -> Result<Vec<Value>> {
        let records = extract_fragment(document, &self.record_pointer)?;
        let Value::Array(records) = records else {
            return Err(EtlError::invalid_option(
                "record_pointer",
                format!("'{}' does not reference an array", self.record_pointer),
            ));
        };
        let Some(fields) = &self.fields else {
            return Ok(records.clone());
        };
        records
            .iter()
            .map(|record| {
                let Value::Object(obj) = record else {
                    return Err(EtlError::invalid_option(
                        "fields",
                        format!("cannot project non-object record {record}"),
                    ));
                };
                let projected: Map<String, Value> = fields
                    .iter()
                    .map(|f| (f.clone(), obj.get(f).cloned().unwrap_or(Value::Null)))
                    .collect();
                Ok(Value::Object(projected))
            })
            .collect()
    }
}

impl Action for StructuredFileIngestor {
    fn base(&self) -> &ActionBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ActionBase {
        &mut self.base
    }

    fn verify(&mut self, run: &OverseerOptions) -> Result<()> {
        if self.base.is_verified() {
            return Ok(());
        }
        self.json_endpoint("source", self.base.source())?;
        self.json_endpoint("destination", self.base.destination())?;

        let pointer = self.base.options().extra_str("record_pointer").unwrap_or("");
        if !is_valid_pointer(pointer) {
            return Err(EtlError::InvalidPointer(pointer.to_string()));
        }
        self.record_pointer = pointer.to_string();
        self.fields = self.base.options().extra_strings("fields")?;

        self.base.verify_resources(run)?;
        self.base.mark_verified();
        Ok(())
    }

    fn execute(&mut self, run: &OverseerOptions, _chunk: &DateChunk) -> Result<()> {
        let source = self.json_endpoint("source", self.base.source())?;
        let destination = self.json_endpoint("destination", self.base.destination())?;

        let records = self.select_records(&source.load()?)?;
        if run.is_dryrun() {
            info!(
                action = %self.base.name(),
                records = records.len(),
                destination = %destination.key(),
                "dryrun, not writing records"
            );
            return Ok(());
        }

        let mut output = if self.base.options().truncate_destination {
            Vec::new()
        } else {
            match destination.load_if_exists()? {
                None => Vec::new(),
                Some(Value::Array(existing)) => existing,
                Some(_) => {
                    return Err(EtlError::Endpoint {
                        endpoint: destination.key().to_string(),
                        message: "cannot append records to a non-array document".into(),
                    })
                }
            }
        };
        let count = records.len();
        output.extend(records);
        destination.write(&Value::Array(output))?;
        info!(
            action = %self.base.name(),
            records = count,
            destination = %destination.key(),
            "ingested records"
        );
        Ok(())
    }
}

impl fmt::Display for StructuredFileIngestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.base.describe(f)
    }
}
