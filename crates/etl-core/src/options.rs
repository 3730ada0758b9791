use crate::error::{EtlError, Result};
use crate::types::ActionKind;
use serde::Serialize;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Tri-state booleans
// ---------------------------------------------------------------------------

/// Interpret a configuration value as a boolean. Unrecognized values yield
/// `None` instead of quietly becoming `false`.
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Null => Some(false),
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" | "" => Some(false),
            _ => None,
        },
        Value::Array(_) | Value::Object(_) => None,
    }
}

pub fn bool_option(obj: &Map<String, Value>, key: &str, default: bool) -> Result<bool> {
    match obj.get(key) {
        None => Ok(default),
        Some(v) => parse_bool(v)
            .ok_or_else(|| EtlError::invalid_option(key, format!("'{v}' is not a boolean"))),
    }
}

/// A string or a list of strings. Empty lists and null yield `None`.
pub fn string_list_option(obj: &Map<String, Value>, key: &str) -> Result<Option<Vec<String>>> {
    let list = match obj.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| match i {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(EtlError::invalid_option(
                    key,
                    format!("'{other}' is not a string"),
                )),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(EtlError::invalid_option(
                key,
                format!("expected a string or a list of strings, got {other}"),
            ))
        }
    };
    Ok(if list.is_empty() { None } else { Some(list) })
}

fn string_option(obj: &Map<String, Value>, key: &str) -> Result<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(EtlError::invalid_option(
            key,
            format!("expected a string, got {other}"),
        )),
    }
}

// ---------------------------------------------------------------------------
// ActionOptions
// ---------------------------------------------------------------------------

/// Keys interpreted by [`ActionOptions`]; everything else lands in `extra`.
const KNOWN_KEYS: &[&str] = &[
    "name",
    "class",
    "namespace",
    "factory",
    "options_class",
    "description",
    "enabled",
    "paths",
    "definition_file",
    "truncate_destination",
    "stop_on_exception",
    "utility",
    "source",
    "destination",
    "variables",
    "include_only_resource_codes",
    "exclude_resource_codes",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointKeys {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl EndpointKeys {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("utility", self.utility.as_deref()),
            ("source", self.source.as_deref()),
            ("destination", self.destination.as_deref()),
        ]
        .into_iter()
        .filter_map(|(role, key)| key.map(|k| (role, k)))
    }
}

/// Options of one configured action after defaults have been applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOptions {
    /// Fully qualified `module.section.action` name.
    pub name: String,
    pub section: String,
    pub class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "factory")]
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub paths: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition_file: Option<String>,
    pub truncate_destination: bool,
    pub stop_on_exception: bool,
    pub endpoints: EndpointKeys,
    pub variables: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_only_resource_codes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_resource_codes: Option<Vec<String>>,
    /// Action-specific options.
    pub extra: Map<String, Value>,
}

impl ActionOptions {
    /// Build from a configuration object whose `name` is already qualified
    /// and whose endpoint roles hold registered endpoint keys.
    pub fn from_object(section: &str, obj: &Map<String, Value>) -> Result<Self> {
        let name = string_option(obj, "name")?.unwrap_or_default();
        let class = string_option(obj, "class")?.or_else(|| {
            name.rsplit('.').next().filter(|s| !s.is_empty()).map(str::to_string)
        });

        let kind = match (obj.get("factory"), obj.get("options_class")) {
            (Some(Value::String(f)), _) if !f.is_empty() => Some(f.parse::<ActionKind>()?),
            (_, Some(Value::String(o))) if !o.is_empty() => Some(o.parse::<ActionKind>()?),
            _ => None,
        };

        let paths = match obj.get("paths") {
            Some(Value::Object(m)) => m.clone(),
            None | Some(Value::Null) => Map::new(),
            Some(other) => {
                return Err(EtlError::invalid_option(
                    "paths",
                    format!("expected an object, got {other}"),
                ))
            }
        };

        let mut missing = Vec::new();
        if name.is_empty() {
            missing.push("name".to_string());
        }
        if class.is_none() {
            missing.push("class".to_string());
        }
        if kind.is_none() {
            missing.push("factory".to_string());
        }
        if paths.is_empty() {
            missing.push("paths".to_string());
        }
        let (class, kind) = match (class, kind) {
            (Some(class), Some(kind)) if missing.is_empty() => (class, kind),
            _ => {
                return Err(EtlError::MissingOptions {
                    name: if name.is_empty() { section.to_string() } else { name },
                    missing,
                })
            }
        };

        let variables = match obj.get("variables") {
            Some(Value::Object(m)) => m.clone(),
            None | Some(Value::Null) => Map::new(),
            Some(other) => {
                return Err(EtlError::invalid_option(
                    "variables",
                    format!("expected an object, got {other}"),
                ))
            }
        };

        let extra = obj
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(ActionOptions {
            section: section.to_string(),
            class,
            namespace: string_option(obj, "namespace")?,
            kind,
            description: string_option(obj, "description")?,
            enabled: bool_option(obj, "enabled", false)?,
            paths,
            definition_file: string_option(obj, "definition_file")?,
            truncate_destination: bool_option(obj, "truncate_destination", false)?,
            stop_on_exception: bool_option(obj, "stop_on_exception", true)?,
            endpoints: EndpointKeys {
                utility: string_option(obj, "utility")?,
                source: string_option(obj, "source")?,
                destination: string_option(obj, "destination")?,
            },
            variables,
            include_only_resource_codes: string_list_option(obj, "include_only_resource_codes")?,
            exclude_resource_codes: string_list_option(obj, "exclude_resource_codes")?,
            extra,
            name,
        })
    }

    /// Unqualified action name (last dotted component).
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn path(&self, key: &str) -> Option<&str> {
        self.paths.get(key).and_then(Value::as_str)
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn extra_bool(&self, key: &str, default: bool) -> Result<bool> {
        bool_option(&self.extra, key, default)
    }

    pub fn extra_strings(&self, key: &str) -> Result<Option<Vec<String>>> {
        string_list_option(&self.extra, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn minimal() -> Value {
        json!({
            "name": "etl.jobs.load",
            "factory": "IngestorFactory",
            "enabled": true,
            "paths": {"base_dir": "/etc/etl"}
        })
    }

    #[test]
    fn tri_state_booleans() {
        for v in [json!(true), json!("yes"), json!("ON"), json!(1), json!("1")] {
            assert_eq!(parse_bool(&v), Some(true), "{v}");
        }
        for v in [json!(false), json!("no"), json!("off"), json!(0), json!(""), Value::Null] {
            assert_eq!(parse_bool(&v), Some(false), "{v}");
        }
        for v in [json!("maybe"), json!(2), json!([true]), json!({})] {
            assert_eq!(parse_bool(&v), None, "{v}");
        }
    }

    #[test]
    fn defaults_are_applied() {
        let opts = ActionOptions::from_object("etl.jobs", &obj(minimal())).unwrap();
        assert_eq!(opts.class, "load");
        assert_eq!(opts.kind, ActionKind::Ingestor);
        assert!(opts.enabled);
        assert!(opts.stop_on_exception);
        assert!(!opts.truncate_destination);
        assert_eq!(opts.short_name(), "load");
    }

    #[test]
    fn factory_can_come_from_options_class() {
        let mut v = minimal();
        v.as_object_mut().unwrap().remove("factory");
        v["options_class"] = json!("MaintenanceOptions");
        let opts = ActionOptions::from_object("etl.jobs", &obj(v)).unwrap();
        assert_eq!(opts.kind, ActionKind::Maintenance);
    }

    #[test]
    fn missing_required_options_are_listed_together() {
        let err = ActionOptions::from_object("etl.jobs", &obj(json!({"name": "etl.jobs.x"})))
            .unwrap_err();
        match err {
            EtlError::MissingOptions { name, missing } => {
                assert_eq!(name, "etl.jobs.x");
                assert_eq!(missing, ["factory", "paths"]);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn invalid_boolean_is_rejected() {
        let mut v = minimal();
        v["stop_on_exception"] = json!("sometimes");
        let err = ActionOptions::from_object("etl.jobs", &obj(v)).unwrap_err();
        assert!(matches!(err, EtlError::InvalidOption { .. }));
    }

    #[test]
    fn unknown_keys_are_kept_as_extra() {
        let mut v = minimal();
        v["record_pointer"] = json!("/rows");
        v["include_only_resource_codes"] = json!("frearson");
        v["utility"] = json!("jsonfile-codes");
        let opts = ActionOptions::from_object("etl.jobs", &obj(v)).unwrap();
        assert_eq!(opts.extra_str("record_pointer"), Some("/rows"));
        assert_eq!(
            opts.include_only_resource_codes,
            Some(vec!["frearson".to_string()])
        );
        assert_eq!(
            opts.endpoints.iter().collect::<Vec<_>>(),
            [("utility", "jsonfile-codes")]
        );
        assert!(opts.extra("utility").is_none());
    }
}
