use super::{DataEndpoint, EndpointSpec, ResourceCodeMap};
use crate::error::{EtlError, Result};
use crate::io::{read_json, write_json};
use crate::pointer::extract_fragment;
use serde_json::Value;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

// ---------------------------------------------------------------------------
// jsonfile
// ---------------------------------------------------------------------------

/// A JSON document on disk. Verification reads and decodes it; a file that
/// does not exist yet verifies as long as its directory does, so the same
/// type serves as a destination.
pub struct JsonFileEndpoint {
    key: String,
    name: String,
    path: PathBuf,
    schema: Option<String>,
    resource_codes_pointer: String,
    connected: Cell<bool>,
}

impl JsonFileEndpoint {
    pub const TYPE: &'static str = "jsonfile";

    pub fn create(spec: &EndpointSpec) -> Result<Rc<dyn DataEndpoint>> {
        Ok(Rc::new(Self::from_spec(spec)?))
    }

    pub fn from_spec(spec: &EndpointSpec) -> Result<Self> {
        let path = spec.qualify(spec.required_str("path")?);
        Ok(JsonFileEndpoint {
            key: format!("{}:{}", Self::TYPE, path.display()),
            name: spec.name.clone(),
            path,
            schema: spec.option_str("schema").map(str::to_string),
            resource_codes_pointer: spec
                .option_str("resource_codes_pointer")
                .unwrap_or("")
                .to_string(),
            connected: Cell::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decoded document as it is on disk now. Earlier actions in the same
    /// run may have rewritten the file since verification.
    pub fn load(&self) -> Result<Value> {
        self.read()
    }

    /// Document contents, or `None` when the file does not exist yet.
    pub fn load_if_exists(&self) -> Result<Option<Value>> {
        if !self.path.exists() {
            return Ok(None);
        }
        self.load().map(Some)
    }

    pub fn write(&self, value: &Value) -> Result<()> {
        write_json(&self.path, value)?;
        debug!(endpoint = %self.key, "wrote document");
        Ok(())
    }

    fn read(&self) -> Result<Value> {
        read_json(&self.path).map_err(|e| EtlError::Endpoint {
            endpoint: self.key.clone(),
            message: e.to_string(),
        })
    }
}

impl DataEndpoint for JsonFileEndpoint {
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint_type(&self) -> &str {
        Self::TYPE
    }

    fn verify(&self, dryrun: bool, leave_connected: bool) -> Result<()> {
        if !self.path.exists() {
            let parent = self.path.parent().unwrap_or(Path::new("/"));
            if parent.is_dir() {
                return Ok(());
            }
            return Err(EtlError::Endpoint {
                endpoint: self.key.clone(),
                message: format!("neither the file nor {} exists", parent.display()),
            });
        }
        self.read()?;
        if leave_connected && !dryrun {
            self.connected.set(true);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn disconnect(&self) {
        self.connected.set(false);
    }

    fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// The object at `resource_codes_pointer` (default: the whole document)
    /// read as `code -> integer id`.
    fn resource_code_map(&self) -> Result<ResourceCodeMap> {
        let doc = self.load()?;
        let fragment = extract_fragment(&doc, &self.resource_codes_pointer)?;
        let invalid = |msg: String| EtlError::Endpoint {
            endpoint: self.key.clone(),
            message: msg,
        };
        let map = fragment
            .as_object()
            .ok_or_else(|| invalid("resource codes must be an object of code to id".into()))?;
        map.iter()
            .map(|(code, id)| {
                id.as_i64()
                    .map(|id| (code.clone(), id))
                    .ok_or_else(|| invalid(format!("resource '{code}' has non-integer id {id}")))
            })
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Display for JsonFileEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, Self::TYPE, self.path.display())
    }
}

// ---------------------------------------------------------------------------
// directory
// ---------------------------------------------------------------------------

pub struct DirectoryEndpoint {
    key: String,
    name: String,
    path: PathBuf,
    schema: Option<String>,
}

impl DirectoryEndpoint {
    pub const TYPE: &'static str = "directory";

    pub fn create(spec: &EndpointSpec) -> Result<Rc<dyn DataEndpoint>> {
        let path = spec.qualify(spec.required_str("path")?);
        Ok(Rc::new(DirectoryEndpoint {
            key: format!("{}:{}", Self::TYPE, path.display()),
            name: spec.name.clone(),
            path,
            schema: spec.option_str("schema").map(str::to_string),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataEndpoint for DirectoryEndpoint {
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint_type(&self) -> &str {
        Self::TYPE
    }

    fn verify(&self, _dryrun: bool, _leave_connected: bool) -> Result<()> {
        if self.path.is_dir() {
            Ok(())
        } else {
            Err(EtlError::Endpoint {
                endpoint: self.key.clone(),
                message: "directory does not exist".into(),
            })
        }
    }

    fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Display for DirectoryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, Self::TYPE, self.path.display())
    }
}
