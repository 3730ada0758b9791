use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

/// Category of an action. Each category has its own factory name (as written
/// in configuration) and default registry namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Ingestor,
    Aggregator,
    Maintenance,
}

impl ActionKind {
    pub fn all() -> &'static [ActionKind] {
        &[
            ActionKind::Ingestor,
            ActionKind::Aggregator,
            ActionKind::Maintenance,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Ingestor => "ingestor",
            ActionKind::Aggregator => "aggregator",
            ActionKind::Maintenance => "maintenance",
        }
    }

    /// Namespace prefixed to an unqualified class name.
    pub fn default_namespace(self) -> &'static str {
        self.as_str()
    }

    pub fn factory_name(self) -> &'static str {
        match self {
            ActionKind::Ingestor => "IngestorFactory",
            ActionKind::Aggregator => "AggregatorFactory",
            ActionKind::Maintenance => "MaintenanceFactory",
        }
    }

    pub fn options_class_name(self) -> &'static str {
        match self {
            ActionKind::Ingestor => "IngestorOptions",
            ActionKind::Aggregator => "AggregatorOptions",
            ActionKind::Maintenance => "MaintenanceOptions",
        }
    }

    /// Accepts a factory name, an options class name or the bare category,
    /// optionally namespace-qualified (`ETL\Ingestor\IngestorFactory`).
    pub fn from_config_name(name: &str) -> Option<ActionKind> {
        let short = name
            .rsplit(|c: char| c == '\\' || c == ':' || c == '.')
            .next()
            .unwrap_or(name);
        ActionKind::all().iter().copied().find(|k| {
            short.eq_ignore_ascii_case(k.factory_name())
                || short.eq_ignore_ascii_case(k.options_class_name())
                || short.eq_ignore_ascii_case(k.as_str())
        })
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = crate::error::EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::from_config_name(s)
            .ok_or_else(|| crate::error::EtlError::invalid_option("factory", format!("unknown action category '{s}'")))
    }
}
