//! Data endpoints: the sources and sinks actions read from and write to.
//!
//! The orchestrator only needs a small contract from an endpoint: a stable
//! key, a way to verify it is reachable, value quoting for restriction
//! literals and optionally a resource-code map. Concrete endpoints are
//! created from configuration through an [`EndpointRegistry`] keyed by the
//! configuration's `type` tag.

mod file;

pub use file::{DirectoryEndpoint, JsonFileEndpoint};

use crate::error::{EtlError, Result};
use crate::paths::{qualify_path, BASE_DIR_KEY, DATA_DIR_KEY};
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Resource code to numeric id.
pub type ResourceCodeMap = BTreeMap<String, i64>;

pub trait DataEndpoint: fmt::Display {
    /// Unique key; two configurations describing the same target share it.
    fn key(&self) -> &str;

    fn name(&self) -> &str;

    fn endpoint_type(&self) -> &str;

    /// Check the endpoint is reachable. When `leave_connected` is set and
    /// this is not a dry run, keep whatever handle verification opened.
    fn verify(&self, dryrun: bool, leave_connected: bool) -> Result<()>;

    fn is_connected(&self) -> bool {
        false
    }

    fn disconnect(&self) {}

    fn schema(&self) -> Option<&str> {
        None
    }

    /// Render `value` as a literal safe to splice into a query.
    fn quote(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn resource_code_map(&self) -> Result<ResourceCodeMap> {
        Err(EtlError::Endpoint {
            endpoint: self.key().to_string(),
            message: "endpoint does not provide a resource code map".to_string(),
        })
    }

    fn as_any(&self) -> &dyn Any;
}

/// Everything a constructor needs to build an endpoint from configuration.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub endpoint_type: String,
    pub name: String,
    pub options: Map<String, Value>,
    pub paths: Map<String, Value>,
    pub base_dir: PathBuf,
}

impl EndpointSpec {
    pub fn from_config(
        config: &Map<String, Value>,
        paths: &Map<String, Value>,
        base_dir: &Path,
    ) -> Result<Self> {
        let endpoint_type = config
            .get("type")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EtlError::ConfigInvalid("data endpoint is missing 'type'".into()))?
            .to_string();
        let name = config
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&endpoint_type)
            .to_string();
        let paths = match config.get("paths") {
            Some(Value::Object(p)) => p.clone(),
            _ => paths.clone(),
        };
        Ok(EndpointSpec {
            endpoint_type,
            name,
            options: config.clone(),
            paths,
            base_dir: base_dir.to_path_buf(),
        })
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    /// Resolve a file option against `paths.data_dir`, falling back to
    /// `paths.base_dir` and then the configuration directory.
    pub fn qualify(&self, file: &str) -> PathBuf {
        let root = self
            .paths
            .get(DATA_DIR_KEY)
            .or_else(|| self.paths.get(BASE_DIR_KEY))
            .and_then(Value::as_str)
            .map(|p| qualify_path(p, &self.base_dir))
            .unwrap_or_else(|| self.base_dir.clone());
        qualify_path(file, &root)
    }

    pub fn required_str(&self, key: &str) -> Result<&str> {
        self.option_str(key).ok_or_else(|| {
            EtlError::ConfigInvalid(format!(
                "{} endpoint '{}' is missing option '{key}'",
                self.endpoint_type, self.name
            ))
        })
    }
}

pub type EndpointConstructor = Rc<dyn Fn(&EndpointSpec) -> Result<Rc<dyn DataEndpoint>>>;

/// Maps configuration `type` tags to endpoint constructors.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    constructors: BTreeMap<String, EndpointConstructor>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the file-backed endpoint types.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(JsonFileEndpoint::TYPE, Rc::new(JsonFileEndpoint::create));
        registry.register(DirectoryEndpoint::TYPE, Rc::new(DirectoryEndpoint::create));
        registry
    }

    pub fn register(&mut self, endpoint_type: &str, constructor: EndpointConstructor) {
        self.constructors
            .insert(endpoint_type.to_ascii_lowercase(), constructor);
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn create(&self, spec: &EndpointSpec) -> Result<Rc<dyn DataEndpoint>> {
        let constructor = self
            .constructors
            .get(&spec.endpoint_type.to_ascii_lowercase())
            .ok_or_else(|| EtlError::EndpointType(spec.endpoint_type.clone()))?;
        constructor(spec)
    }
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(config: Value) -> EndpointSpec {
        EndpointSpec::from_config(
            config.as_object().unwrap(),
            json!({"data_dir": "data"}).as_object().unwrap(),
            Path::new("/etc/etl"),
        )
        .unwrap()
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = EndpointRegistry::with_builtin();
        let err = registry
            .create(&spec(json!({"type": "mysql", "name": "db"})))
            .err()
            .unwrap();
        assert!(matches!(err, EtlError::EndpointType(t) if t == "mysql"));
    }

    #[test]
    fn missing_type_is_invalid() {
        let err = EndpointSpec::from_config(
            json!({"name": "x"}).as_object().unwrap(),
            &Map::new(),
            Path::new("/"),
        )
        .unwrap_err();
        assert!(matches!(err, EtlError::ConfigInvalid(_)));
    }

    #[test]
    fn files_resolve_against_data_dir() {
        let s = spec(json!({"type": "jsonfile", "path": "in/users.json"}));
        assert_eq!(s.qualify("in/users.json"), PathBuf::from("/etc/etl/data/in/users.json"));
        assert_eq!(s.qualify("/abs.json"), PathBuf::from("/abs.json"));
    }

    #[test]
    fn default_quote_escapes_single_quotes() {
        let registry = EndpointRegistry::with_builtin();
        let ep = registry
            .create(&spec(json!({"type": "directory", "path": "."})))
            .unwrap();
        assert_eq!(ep.quote("2020-01-01 00:00:00"), "'2020-01-01 00:00:00'");
        assert_eq!(ep.quote("o'brien"), "'o''brien'");
    }
}
