//! JSON configuration documents with key handlers and recursive includes.
//!
//! A document is parsed once into an ordered set of named sections. Top-level
//! keys may have handlers attached: PRE handlers run before plain keys are
//! copied, POST handlers run over the merged result. The built-in PRE handler
//! for `include` pulls every section of another document into this one.
//!
//! Before any handler runs, objects of the form `{"$ref": "file.json#/ptr"}`
//! are replaced, at any depth, by the fragment they point to.

use crate::error::{EtlError, Result};
use crate::io::read_json;
use crate::paths::{
    absolutize, base_dir_of, qualify_path, COMMENT_PREFIX, INCLUDE_KEY, REFERENCE_KEY,
};
use crate::pointer::extract_fragment;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// Object type used for the constructed tree.
pub type Object = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStage {
    Pre,
    Post,
}

/// What a key handler can see about the document it runs for.
pub struct HandlerContext<'a> {
    pub path: &'a Path,
    pub base_dir: &'a Path,
    /// Documents currently being included above this one, outermost first.
    pub include_chain: &'a [PathBuf],
}

/// Receives the key, its raw value and the accumulator built so far, and
/// returns the accumulator to carry forward.
pub type KeyHandler = Rc<dyn Fn(&HandlerContext<'_>, &str, &Value, Object) -> Result<Object>>;

pub struct ConfigurationDocument {
    path: PathBuf,
    base_dir: PathBuf,
    include_chain: Vec<PathBuf>,
    pre_handlers: Vec<(String, KeyHandler)>,
    post_handlers: Vec<(String, KeyHandler)>,
    raw: Option<Value>,
    constructed: Option<Object>,
    section_names: Vec<String>,
    sections: HashMap<String, Value>,
    parsed: bool,
}

impl ConfigurationDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_chain(path.into(), Vec::new())
    }

    fn with_chain(path: PathBuf, include_chain: Vec<PathBuf>) -> Self {
        let path = absolutize(&path);
        let base_dir = base_dir_of(&path);
        let mut doc = ConfigurationDocument {
            path,
            base_dir,
            include_chain,
            pre_handlers: Vec::new(),
            post_handlers: Vec::new(),
            raw: None,
            constructed: None,
            section_names: Vec::new(),
            sections: HashMap::new(),
            parsed: false,
        };
        doc.register_handler(HandlerStage::Pre, INCLUDE_KEY, Rc::new(include_handler));
        doc
    }

    /// Attach a handler to a top-level key. Registering the same key twice
    /// in one stage replaces the earlier handler but keeps its position.
    pub fn register_handler(&mut self, stage: HandlerStage, key: &str, handler: KeyHandler) {
        let list = match stage {
            HandlerStage::Pre => &mut self.pre_handlers,
            HandlerStage::Post => &mut self.post_handlers,
        };
        match list.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = handler,
            None => list.push((key.to_string(), handler)),
        }
    }

    /// Read, decode and process the document. A second call is a no-op
    /// unless `force` is set. On failure the previously parsed state is kept.
    pub fn parse(&mut self, force: bool) -> Result<()> {
        if self.parsed && !force {
            return Ok(());
        }

        let raw = remove_comments(read_json(&self.path)?);
        let top = match resolve_references(raw.clone(), &self.path, &self.base_dir)? {
            Value::Object(map) => map,
            _ => {
                return Err(EtlError::ConfigInvalid(format!(
                    "{}: top level must be a JSON object",
                    self.path.display()
                )))
            }
        };

        let ctx = HandlerContext {
            path: &self.path,
            base_dir: &self.base_dir,
            include_chain: &self.include_chain,
        };

        let mut acc = Object::new();
        for (key, handler) in &self.pre_handlers {
            if let Some(value) = top.get(key) {
                acc = handler(&ctx, key, value, acc)?;
            }
        }

        for (key, value) in &top {
            if !self.pre_handlers.iter().any(|(k, _)| k == key) {
                acc.insert(key.clone(), value.clone());
            }
        }

        for (key, handler) in &self.post_handlers {
            let Some(value) = acc.get(key).cloned() else {
                continue;
            };
            match handler(&ctx, key, &value, acc.clone()) {
                Ok(next) => acc = next,
                Err(e) => warn!(
                    file = %self.path.display(),
                    key = %key,
                    "post handler failed, keeping previous value: {e}"
                ),
            }
        }

        self.section_names = acc.keys().cloned().collect();
        self.sections = acc.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.raw = Some(raw);
        self.constructed = Some(acc);
        self.parsed = true;
        debug!(
            file = %self.path.display(),
            sections = self.section_names.len(),
            "parsed configuration document"
        );
        Ok(())
    }

    /// Drop the intermediate trees once sections have been extracted.
    pub fn cleanup(&mut self) {
        self.raw = None;
        self.constructed = None;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    pub fn raw(&self) -> Option<&Value> {
        self.raw.as_ref()
    }

    pub fn constructed(&self) -> Option<&Object> {
        self.constructed.as_ref()
    }

    pub fn section_names(&self) -> &[String] {
        &self.section_names
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    pub fn section(&self, name: &str) -> Option<&Value> {
        self.sections.get(name)
    }

    /// Sections in document order.
    pub fn sections(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.section_names
            .iter()
            .filter_map(|n| self.sections.get(n).map(|v| (n.as_str(), v)))
    }

    pub fn into_sections(mut self) -> Vec<(String, Value)> {
        let names = std::mem::take(&mut self.section_names);
        names
            .into_iter()
            .filter_map(|n| self.sections.remove(&n).map(|v| (n, v)))
            .collect()
    }
}

impl fmt::Debug for ConfigurationDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationDocument")
            .field("path", &self.path)
            .field("base_dir", &self.base_dir)
            .field("parsed", &self.parsed)
            .field("sections", &self.section_names)
            .finish()
    }
}

impl fmt::Display for ConfigurationDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Strip every object key starting with the comment sentinel, at any depth.
pub fn remove_comments(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| !k.starts_with(COMMENT_PREFIX))
                .map(|(k, v)| (k, remove_comments(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(remove_comments).collect()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// $ref
// ---------------------------------------------------------------------------

/// Replace every `{"$ref": "file.json#/pointer"}` object in `value` with the
/// fragment it addresses. Relative files are qualified against `base_dir`,
/// an empty file part means `path` itself and a missing fragment selects the
/// whole document. References found inside a fragment are resolved too.
pub fn resolve_references(value: Value, path: &Path, base_dir: &Path) -> Result<Value> {
    let mut active = Vec::new();
    resolve_value(value, path, base_dir, &mut active)
}

fn resolve_value(
    value: Value,
    path: &Path,
    base_dir: &Path,
    active: &mut Vec<String>,
) -> Result<Value> {
    match value {
        Value::Object(map) if map.contains_key(REFERENCE_KEY) => {
            let invalid = |message: String| {
                EtlError::ConfigInvalid(format!("{}: {message}", path.display()))
            };
            if map.len() != 1 {
                return Err(invalid(format!(
                    "'{REFERENCE_KEY}' cannot be mixed with other keys in an object"
                )));
            }
            let Some(Value::String(reference)) = map.get(REFERENCE_KEY) else {
                return Err(invalid(format!("'{REFERENCE_KEY}' must be a string")));
            };
            let (file, pointer) = reference.split_once('#').unwrap_or((reference.as_str(), ""));
            let file = file.strip_prefix("file://").unwrap_or(file);
            if file.contains("://") {
                return Err(invalid(format!("unsupported reference '{reference}'")));
            }
            let target = if file.is_empty() {
                path.to_path_buf()
            } else {
                qualify_path(file, base_dir)
            };

            let id = format!("{}#{pointer}", target.display());
            if active.contains(&id) {
                return Err(invalid(format!("reference cycle through '{reference}'")));
            }
            let document = remove_comments(read_json(&target)?);
            let fragment = extract_fragment(&document, pointer)?.clone();
            debug!(file = %path.display(), reference = %reference, "resolved reference");

            active.push(id);
            let resolved = resolve_value(fragment, path, base_dir, active);
            active.pop();
            resolved
        }
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| Ok((k, resolve_value(v, path, base_dir, active)?)))
            .collect::<Result<Object>>()
            .map(Value::Object),
        Value::Array(items) => items
            .into_iter()
            .map(|v| resolve_value(v, path, base_dir, active))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

// ---------------------------------------------------------------------------
// include
// ---------------------------------------------------------------------------

fn include_handler(
    ctx: &HandlerContext<'_>,
    key: &str,
    value: &Value,
    mut acc: Object,
) -> Result<Object> {
    let includes: Vec<&str> = match value {
        Value::Null => return Ok(acc),
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let s = item.as_str();
                if s.is_none() {
                    warn!(file = %ctx.path.display(), "skipping non-string {key} entry: {item}");
                }
                s
            })
            .collect(),
        Value::Object(_) => {
            warn!(file = %ctx.path.display(), "{key} must be a path or a list of paths, skipping object");
            return Ok(acc);
        }
        other => {
            warn!(file = %ctx.path.display(), "skipping unsupported {key} value: {other}");
            return Ok(acc);
        }
    };

    for include in includes {
        let resolved = qualify_path(include, ctx.base_dir);
        if resolved == ctx.path || ctx.include_chain.contains(&resolved) {
            return Err(EtlError::ConfigInvalid(format!(
                "include cycle: {} includes {}",
                ctx.path.display(),
                resolved.display()
            )));
        }

        let mut chain = ctx.include_chain.to_vec();
        chain.push(ctx.path.to_path_buf());
        let mut doc = ConfigurationDocument::with_chain(resolved.clone(), chain);
        match doc.parse(false) {
            Ok(()) => {}
            Err(e @ (EtlError::ConfigFileNotFound(_) | EtlError::ConfigFileNotReadable { .. })) => {
                warn!(file = %ctx.path.display(), "skipping include: {e}");
                continue;
            }
            Err(e) => return Err(e),
        }
        debug!(file = %ctx.path.display(), include = %resolved.display(), "included document");
        for (name, section) in doc.into_sections() {
            acc.insert(name, section);
        }
    }
    Ok(acc)
}
