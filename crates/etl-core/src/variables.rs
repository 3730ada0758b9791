//! Write-once variable store with `${NAME}` substitution.
//!
//! Names are stored case-sensitively but matched case-insensitively when
//! substituting. `set` never replaces an existing value, so whichever source
//! writes a name first (command line, then configuration paths, then action
//! variables) keeps it; `overwrite` is the explicit escape hatch.

use crate::error::{EtlError, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::Location;
use std::sync::OnceLock;
use tracing::debug;

static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

fn token_re() -> &'static Regex {
    TOKEN_RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").unwrap())
}

// ---------------------------------------------------------------------------
// Scalar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    /// Convert a JSON value. `null` yields `None`; arrays and objects are
    /// rejected.
    pub fn from_json(name: &str, value: &Value) -> Result<Option<Scalar>> {
        match value {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(Scalar::Bool(*b))),
            Value::Number(n) => Ok(Some(match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => Scalar::Float(n.as_f64().unwrap_or_default()),
            })),
            Value::String(s) => Ok(Some(Scalar::Str(s.clone()))),
            Value::Array(_) | Value::Object(_) => {
                Err(EtlError::NonScalarVariable(name.to_string()))
            }
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Str(s) => Value::String(s.clone()),
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(f) => Value::from(*f),
            Scalar::Bool(b) => Value::Bool(*b),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Str(s) => f.write_str(s),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<i32> for Scalar {
    fn from(i: i32) -> Self {
        Scalar::Int(i64::from(i))
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::Float(f)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

// ---------------------------------------------------------------------------
// VariableStore
// ---------------------------------------------------------------------------

/// Which variables a substitution used and which tokens survived it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubstitutionDetails {
    /// Stored names that matched at least one token, in order of first use.
    pub substituted: Vec<String>,
    /// Stored names that no token referenced.
    pub unused: Vec<String>,
    /// `${...}` tokens present in the result.
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct VariableStore {
    vars: BTreeMap<String, Scalar>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a JSON object, first key wins within it.
    pub fn from_json_map(map: &Map<String, Value>) -> Result<Self> {
        let mut store = Self::new();
        for (name, value) in map {
            store.set_json(name, value)?;
        }
        Ok(store)
    }

    /// Store `value` unless `name` is already present. Returns whether the
    /// value was stored.
    pub fn set(&mut self, name: &str, value: impl Into<Scalar>) -> bool {
        if let Some(existing) = self.vars.get(name) {
            debug!(variable = name, current = %existing, "variable already set, ignoring new value");
            return false;
        }
        self.vars.insert(name.to_string(), value.into());
        true
    }

    /// JSON flavour of [`set`](Self::set): `null` removes the variable.
    pub fn set_json(&mut self, name: &str, value: &Value) -> Result<bool> {
        match Scalar::from_json(name, value)? {
            None => {
                self.vars.remove(name);
                Ok(false)
            }
            Some(v) => Ok(self.set(name, v)),
        }
    }

    pub fn overwrite(&mut self, name: &str, value: impl Into<Scalar>) {
        self.vars.insert(name.to_string(), value.into());
    }

    /// JSON flavour of [`overwrite`](Self::overwrite): `null` removes the variable.
    pub fn overwrite_json(&mut self, name: &str, value: &Value) -> Result<()> {
        match Scalar::from_json(name, value)? {
            None => {
                self.vars.remove(name);
            }
            Some(v) => self.overwrite(name, v),
        }
        Ok(())
    }

    /// Add every variable of `other` that is not already present here.
    pub fn merge_missing(&mut self, other: &VariableStore) {
        for (name, value) in &other.vars {
            self.set(name, value.clone());
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Scalar> {
        self.vars.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_json_map(&self) -> Map<String, Value> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }

    /// Replace `${NAME}` tokens, matching names case-insensitively. When
    /// `exception_prefix` is given, any token left in the result is an
    /// [`EtlError::UnresolvedVariable`] carrying the caller's location.
    #[track_caller]
    pub fn substitute(&self, template: &str, exception_prefix: Option<&str>) -> Result<String> {
        let (out, details) = self.substitute_with_details(template);
        if let Some(prefix) = exception_prefix {
            if !details.unresolved.is_empty() {
                let caller = Location::caller();
                return Err(EtlError::UnresolvedVariable {
                    prefix: prefix.to_string(),
                    tokens: details.unresolved,
                    original: template.to_string(),
                    location: format!("{}:{}", caller.file(), caller.line()),
                });
            }
        }
        Ok(out)
    }

    /// Single pass over `template`: values that themselves contain `${...}`
    /// are inserted verbatim and not expanded again.
    pub fn substitute_with_details(&self, template: &str) -> (String, SubstitutionDetails) {
        let mut details = SubstitutionDetails::default();
        if template.is_empty() {
            details.unused = self.vars.keys().cloned().collect();
            return (String::new(), details);
        }

        let mut by_lower: HashMap<String, (&str, &Scalar)> = HashMap::new();
        for (name, value) in &self.vars {
            by_lower
                .entry(name.to_lowercase())
                .or_insert((name.as_str(), value));
        }

        let out = token_re().replace_all(template, |caps: &regex::Captures<'_>| {
            match by_lower.get(&caps[1].to_lowercase()) {
                Some((name, value)) => {
                    if !details.substituted.iter().any(|n| n == name) {
                        details.substituted.push(name.to_string());
                    }
                    value.to_string()
                }
                None => caps[0].to_string(),
            }
        });
        let out = out.into_owned();

        details.unused = self
            .vars
            .keys()
            .filter(|k| !details.substituted.contains(k))
            .cloned()
            .collect();
        for m in token_re().find_iter(&out) {
            let token = m.as_str().to_string();
            if !details.unresolved.contains(&token) {
                details.unresolved.push(token);
            }
        }
        (out, details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn set_is_first_writer_wins() {
        let mut vars = VariableStore::new();
        assert!(vars.set("SCHEMA", "cli"));
        assert!(!vars.set("SCHEMA", "config"));
        assert_eq!(vars.get("SCHEMA"), Some(&Scalar::from("cli")));
    }

    #[test]
    fn overwrite_always_replaces() {
        let mut vars = VariableStore::new();
        vars.set("N", 1);
        vars.overwrite("N", 2);
        assert_eq!(vars.get("N"), Some(&Scalar::Int(2)));
        vars.overwrite_json("N", &Value::Null).unwrap();
        assert!(!vars.contains("N"));
    }

    #[test]
    fn null_set_removes() {
        let mut vars = VariableStore::new();
        vars.set("A", "x");
        assert!(!vars.set_json("A", &Value::Null).unwrap());
        assert!(!vars.contains("A"));
    }

    #[test]
    fn non_scalars_are_rejected() {
        let mut vars = VariableStore::new();
        assert!(matches!(
            vars.set_json("A", &json!([1])),
            Err(EtlError::NonScalarVariable(_))
        ));
        assert!(vars.set_json("B", &json!({"x": 1})).is_err());
    }

    #[test]
    fn substitution_is_case_insensitive() {
        let mut vars = VariableStore::new();
        vars.set("Schema", "modw");
        vars.set("days", 7);
        let out = vars
            .substitute("select * from ${SCHEMA}.t -- ${Days} ${schema}", None)
            .unwrap();
        assert_eq!(out, "select * from modw.t -- 7 modw");
    }

    #[test]
    fn unresolved_tokens_pass_through_without_prefix() {
        let vars = VariableStore::new();
        assert_eq!(vars.substitute("a ${MISSING} b", None).unwrap(), "a ${MISSING} b");
    }

    #[test]
    fn strict_substitution_names_tokens_and_caller() {
        let mut vars = VariableStore::new();
        vars.set("A", "1");
        let err = vars
            .substitute("${A} ${B} ${C} ${B}", Some("building query"))
            .unwrap_err();
        match err {
            EtlError::UnresolvedVariable {
                prefix,
                tokens,
                original,
                location,
            } => {
                assert_eq!(prefix, "building query");
                assert_eq!(tokens, ["${B}", "${C}"]);
                assert_eq!(original, "${A} ${B} ${C} ${B}");
                assert!(location.contains("variables.rs"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn values_are_not_substituted_twice() {
        let mut vars = VariableStore::new();
        vars.set("A", "${B}");
        vars.set("B", "boom");
        let (out, details) = vars.substitute_with_details("${A}");
        assert_eq!(out, "${B}");
        assert_eq!(details.substituted, ["A"]);
        assert_eq!(details.unused, ["B"]);
        assert_eq!(details.unresolved, ["${B}"]);
    }

    #[test]
    fn empty_template_is_returned_as_is() {
        let mut vars = VariableStore::new();
        vars.set("A", "1");
        assert_eq!(vars.substitute("", Some("strict")).unwrap(), "");
    }

    #[test]
    fn merge_missing_keeps_existing_values() {
        let mut cli = VariableStore::new();
        cli.set("DATA_DIR", "/override");
        let mut paths = VariableStore::new();
        paths.set("DATA_DIR", "/etc/data");
        paths.set("LOG_DIR", "/var/log");
        cli.merge_missing(&paths);
        assert_eq!(cli.get("DATA_DIR"), Some(&Scalar::from("/override")));
        assert_eq!(cli.get("LOG_DIR"), Some(&Scalar::from("/var/log")));
    }

    #[test]
    fn scalars_render_plainly() {
        assert_eq!(Scalar::from(true).to_string(), "true");
        assert_eq!(Scalar::from(1.5).to_string(), "1.5");
        assert_eq!(
            Scalar::from_json("n", &json!(3)).unwrap(),
            Some(Scalar::Int(3))
        );
    }

    proptest! {
        #[test]
        fn substitution_without_tokens_is_identity(s in "[^$]*") {
            let mut vars = VariableStore::new();
            vars.set("A", "x");
            prop_assert_eq!(vars.substitute(&s, Some("strict")).unwrap(), s);
        }

        #[test]
        fn second_set_never_changes_value(a in any::<i64>(), b in any::<i64>()) {
            let mut vars = VariableStore::new();
            vars.set("K", a);
            vars.set("K", b);
            prop_assert_eq!(vars.get("K"), Some(&Scalar::Int(a)));
        }
    }
}
