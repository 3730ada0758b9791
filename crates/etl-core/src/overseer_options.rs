//! Run parameters for one overseer invocation.
//!
//! [`OverseerOptions::from_map`] takes the flat option map a command line
//! produces (`start-date`, `chunk-size-days`, `dryrun`, ...), validates every
//! value and computes the chunk list once. Nothing about the window changes
//! after construction; only the resource-code map is filled in lazily.

use crate::dates::{
    end_of_day, format_date, generate_chunks, parse_date_detailed, serialize_date,
    serialize_opt_date, start_of_day, DateChunk,
};
use crate::endpoint::{DataEndpoint, ResourceCodeMap};
use crate::error::{EtlError, Result};
use crate::options::{parse_bool, ActionOptions};
use crate::paths::DEFAULT_LOCK_FILE_PREFIX;
use crate::query::{Query, Restriction, VALUE_PLACEHOLDER};
use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde_json::{Map, Value};
use std::cell::OnceCell;
use std::path::PathBuf;
use tracing::{debug, info};

/// Per-action replacement for the run-level resource lists. A list given
/// here replaces the run-level list of the same kind; it never extends it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictionOverrides {
    pub include_only_resource_codes: Option<Vec<String>>,
    pub exclude_resource_codes: Option<Vec<String>>,
}

impl RestrictionOverrides {
    pub fn from_action(options: &ActionOptions) -> Self {
        RestrictionOverrides {
            include_only_resource_codes: options.include_only_resource_codes.clone(),
            exclude_resource_codes: options.exclude_resource_codes.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OverseerOptions {
    #[serde(serialize_with = "serialize_date")]
    start_date: NaiveDateTime,
    #[serde(serialize_with = "serialize_date")]
    end_date: NaiveDateTime,
    #[serde(serialize_with = "serialize_opt_date")]
    last_modified_start_date: Option<NaiveDateTime>,
    #[serde(serialize_with = "serialize_opt_date")]
    last_modified_end_date: Option<NaiveDateTime>,
    number_of_days: Option<i64>,
    chunk_size_days: Option<u32>,
    chunks: Vec<DateChunk>,
    force: bool,
    dryrun: bool,
    verbose: bool,
    include_only_resource_codes: Vec<String>,
    exclude_resource_codes: Vec<String>,
    #[serde(skip)]
    resource_codes: OnceCell<ResourceCodeMap>,
    actions: Vec<String>,
    sections: Vec<String>,
    lock_dir: Option<PathBuf>,
    lock_file_prefix: String,
}

impl OverseerOptions {
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        Self::from_map_at(map, Local::now().naive_local())
    }

    /// Like [`from_map`](Self::from_map) with an explicit "now" for relative
    /// dates and defaults.
    pub fn from_map_at(map: &Map<String, Value>, now: NaiveDateTime) -> Result<Self> {
        let number_of_days = match map.get("number-of-days") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let n = integer(v).ok_or_else(|| {
                    EtlError::invalid_option("number-of-days", format!("'{v}' is not an integer"))
                })?;
                if n < 1 {
                    return Err(EtlError::invalid_option("number-of-days", "must be at least 1"));
                }
                Some(n)
            }
        };

        let start = optional_date(map, "start-date", now)?;
        let end = optional_date(map, "end-date", now)?;
        let today = now.date();
        let (start_date, end_date) = match (start, end, number_of_days) {
            (None, None, Some(days)) => (
                start_of_day(today - Duration::days(days - 1)),
                end_of_day(today),
            ),
            (None, None, None) => (now, now),
            (None, Some((end, date_only)), Some(days)) => {
                let end = if date_only { end_of_day(end.date()) } else { end };
                (start_of_day(end.date() - Duration::days(days - 1)), end)
            }
            (start, end, _) => {
                let end = match end {
                    None => end_of_day(today),
                    Some((value, true)) => end_of_day(value.date()),
                    Some((value, false)) => value,
                };
                let start = match start {
                    None => start_of_day(epoch()),
                    Some((value, _)) => value,
                };
                (start, end)
            }
        };
        if start_date > end_date {
            return Err(EtlError::invalid_option(
                "start-date",
                format!(
                    "start {} is after end {}",
                    format_date(&start_date),
                    format_date(&end_date)
                ),
            ));
        }

        let chunk_size_days = match map.get("chunk-size-days") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let n = integer(v).ok_or_else(|| {
                    EtlError::invalid_option("chunk-size-days", format!("'{v}' is not numeric"))
                })?;
                let n = u32::try_from(n)
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| EtlError::invalid_option("chunk-size-days", "must be a positive number of days"))?;
                Some(n)
            }
        };

        let resource_codes = OnceCell::new();
        if let Some(v) = map.get("resource-code-map").filter(|v| !v.is_null()) {
            let _ = resource_codes.set(resource_map(v)?);
        }

        let options = OverseerOptions {
            start_date,
            end_date,
            last_modified_start_date: optional_date(map, "last-modified-start-date", now)?
                .map(|(v, _)| v),
            last_modified_end_date: optional_date(map, "last-modified-end-date", now)?
                .map(|(v, _)| v),
            number_of_days,
            chunk_size_days,
            chunks: generate_chunks(start_date, end_date, chunk_size_days),
            force: flag(map, "force")?,
            dryrun: flag(map, "dryrun")?,
            verbose: flag(map, "verbose")?,
            include_only_resource_codes: list(map, "include-only-resource-codes")?,
            exclude_resource_codes: list(map, "exclude-resource-codes")?,
            resource_codes,
            actions: list(map, "actions")?,
            sections: list(map, "process-sections")?,
            lock_dir: map
                .get("lock-dir")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            lock_file_prefix: match map.get("lock-file-prefix") {
                None | Some(Value::Null) => DEFAULT_LOCK_FILE_PREFIX.to_string(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => {
                    return Err(EtlError::invalid_option(
                        "lock-file-prefix",
                        format!("expected a string, got {other}"),
                    ))
                }
            },
        };
        debug!(
            start = %format_date(&options.start_date),
            end = %format_date(&options.end_date),
            chunks = options.chunks.len(),
            "overseer options"
        );
        Ok(options)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn start_date(&self) -> NaiveDateTime {
        self.start_date
    }

    pub fn end_date(&self) -> NaiveDateTime {
        self.end_date
    }

    pub fn last_modified_start_date(&self) -> Option<NaiveDateTime> {
        self.last_modified_start_date
    }

    pub fn last_modified_end_date(&self) -> Option<NaiveDateTime> {
        self.last_modified_end_date
    }

    pub fn number_of_days(&self) -> Option<i64> {
        self.number_of_days
    }

    pub fn chunk_size_days(&self) -> Option<u32> {
        self.chunk_size_days
    }

    /// Chunks, most recent first.
    pub fn chunks(&self) -> &[DateChunk] {
        &self.chunks
    }

    /// The whole window as one chunk, for actions that do not chunk.
    pub fn full_range(&self) -> DateChunk {
        DateChunk::new(self.start_date, self.end_date)
    }

    pub fn is_force(&self) -> bool {
        self.force
    }

    pub fn is_dryrun(&self) -> bool {
        self.dryrun
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn include_only_resource_codes(&self) -> &[String] {
        &self.include_only_resource_codes
    }

    pub fn exclude_resource_codes(&self) -> &[String] {
        &self.exclude_resource_codes
    }

    pub fn has_resource_filters(&self) -> bool {
        !self.include_only_resource_codes.is_empty() || !self.exclude_resource_codes.is_empty()
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    pub fn sections(&self) -> &[String] {
        &self.sections
    }

    pub fn lock_dir(&self) -> Option<&std::path::Path> {
        self.lock_dir.as_deref()
    }

    pub fn lock_file_prefix(&self) -> &str {
        &self.lock_file_prefix
    }

    // -----------------------------------------------------------------------
    // Resource codes
    // -----------------------------------------------------------------------

    pub fn resource_code_map(&self) -> Option<&ResourceCodeMap> {
        self.resource_codes.get()
    }

    /// Fill the resource-code map from `endpoint` unless it is already set.
    pub fn load_resource_code_map(&self, endpoint: &dyn DataEndpoint) -> Result<&ResourceCodeMap> {
        if let Some(map) = self.resource_codes.get() {
            return Ok(map);
        }
        let map = endpoint.resource_code_map()?;
        info!(endpoint = %endpoint.key(), resources = map.len(), "loaded resource code map");
        Ok(self.resource_codes.get_or_init(|| map))
    }

    /// Resolve every code to its id. All unknown codes are reported at once.
    pub fn resource_ids(&self, codes: &[String]) -> Result<Vec<i64>> {
        let Some(map) = self.resource_codes.get() else {
            return Err(EtlError::UnknownResourceCode(codes.to_vec()));
        };
        let unknown: Vec<String> = codes
            .iter()
            .filter(|c| !map.contains_key(c.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(EtlError::UnknownResourceCode(unknown));
        }
        Ok(codes.iter().filter_map(|c| map.get(c.as_str()).copied()).collect())
    }

    pub fn resource_id(&self, code: &str) -> Result<i64> {
        self.resource_ids(&[code.to_string()]).map(|ids| ids[0])
    }

    // -----------------------------------------------------------------------
    // Restrictions
    // -----------------------------------------------------------------------

    /// Fill every restriction template `query` declares for `chunk`. Dates
    /// are quoted by `endpoint`; resource lists become `(id,id,...)`.
    /// Restriction kinds the overseer does not know are skipped with a
    /// notice, as are kinds with no value for this run.
    pub fn apply_overseer_restrictions(
        &self,
        query: &mut Query,
        endpoint: &dyn DataEndpoint,
        chunk: &DateChunk,
        overrides: &RestrictionOverrides,
    ) -> Result<()> {
        query.clear_restrictions();
        let templates = query.restriction_templates().to_vec();
        for (key, template) in templates {
            let Some(restriction) = Restriction::from_key(&key) else {
                info!(restriction = %key, "unsupported overseer restriction, skipping");
                continue;
            };
            let value = match restriction {
                Restriction::StartDate => Some(endpoint.quote(&format_date(&chunk.start))),
                Restriction::EndDate => Some(endpoint.quote(&format_date(&chunk.end))),
                Restriction::LastModifiedStartDate => self
                    .last_modified_start_date
                    .map(|d| endpoint.quote(&format_date(&d))),
                Restriction::LastModifiedEndDate => self
                    .last_modified_end_date
                    .map(|d| endpoint.quote(&format_date(&d))),
                Restriction::IncludeOnlyResourceCodes => self.resource_list(
                    overrides
                        .include_only_resource_codes
                        .as_deref()
                        .unwrap_or(&self.include_only_resource_codes),
                )?,
                Restriction::ExcludeResourceCodes => self.resource_list(
                    overrides
                        .exclude_resource_codes
                        .as_deref()
                        .unwrap_or(&self.exclude_resource_codes),
                )?,
            };
            if let Some(value) = value {
                query.set_restriction(restriction, template.replace(VALUE_PLACEHOLDER, &value));
            }
        }
        Ok(())
    }

    fn resource_list(&self, codes: &[String]) -> Result<Option<String>> {
        if codes.is_empty() {
            return Ok(None);
        }
        let ids = self.resource_ids(codes)?;
        let joined = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
        Ok(Some(format!("({joined})")))
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn flag(map: &Map<String, Value>, key: &str) -> Result<bool> {
    match map.get(key) {
        None => Ok(false),
        Some(v) => parse_bool(v)
            .ok_or_else(|| EtlError::invalid_option(key, format!("'{v}' is not a boolean"))),
    }
}

fn list(map: &Map<String, Value>, key: &str) -> Result<Vec<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) if s.is_empty() => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| {
                i.as_str().map(str::to_string).ok_or_else(|| {
                    EtlError::invalid_option(key, format!("'{i}' is not a string"))
                })
            })
            .collect(),
        Some(other) => Err(EtlError::invalid_option(
            key,
            format!("expected a list of strings, got {other}"),
        )),
    }
}

fn optional_date(
    map: &Map<String, Value>,
    key: &str,
    now: NaiveDateTime,
) -> Result<Option<(NaiveDateTime, bool)>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => {
            let parsed = parse_date_detailed(s, now)?;
            Ok(Some((parsed.value, parsed.date_only)))
        }
        Some(other) => Err(EtlError::invalid_option(
            key,
            format!("expected a date string, got {other}"),
        )),
    }
}

fn resource_map(value: &Value) -> Result<ResourceCodeMap> {
    let obj = value.as_object().ok_or_else(|| {
        EtlError::invalid_option("resource-code-map", "expected an object of code to id")
    })?;
    obj.iter()
        .map(|(code, id)| {
            integer(id).map(|id| (code.clone(), id)).ok_or_else(|| {
                EtlError::invalid_option("resource-code-map", format!("id of '{code}' is not an integer"))
            })
        })
        .collect()
}
