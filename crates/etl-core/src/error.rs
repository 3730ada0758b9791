use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("configuration file not found: {}", .0.display())]
    ConfigFileNotFound(PathBuf),

    #[error("configuration file not readable: {}: {source}", .path.display())]
    ConfigFileNotReadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("error parsing configuration file {}: {source}", .path.display())]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("unknown sections: {}", .0.join(", "))]
    UnknownSections(Vec<String>),

    #[error("action '{action}' not found in section '{section}'")]
    UnknownAction { action: String, section: String },

    #[error("invalid action name '{0}': expected 'section.action' or 'module.section.action'")]
    InvalidActionName(String),

    #[error("error verifying data endpoints:\n{}", .0.join("\n"))]
    EndpointVerification(Vec<String>),

    #[error("undefined data endpoint type '{0}'")]
    EndpointType(String),

    #[error("data endpoint '{endpoint}': {message}")]
    Endpoint { endpoint: String, message: String },

    #[error("action class '{class}' not found (resolved from '{requested}')")]
    ClassNotFound { requested: String, class: String },

    #[error("action class '{class}' does not implement the {expected} contract")]
    InterfaceNotImplemented { class: String, expected: String },

    #[error("required options not provided for '{name}': {}", .missing.join(", "))]
    MissingOptions { name: String, missing: Vec<String> },

    #[error("invalid value for option '{option}': {message}")]
    InvalidOption { option: String, message: String },

    #[error("error verifying actions: {}", format_tagged(.0))]
    ActionVerification(Vec<(String, String)>),

    #[error("action '{action}' failed: {source}")]
    ActionExecution {
        action: String,
        #[source]
        source: Box<EtlError>,
    },

    #[error(
        "cannot obtain lock: process '{pid}' already running and executing overlapping actions ({})",
        .actions.join(", ")
    )]
    LockConflict { pid: i32, actions: Vec<String> },

    #[error("lock directory {}: {message}", .path.display())]
    LockDir { path: PathBuf, message: String },

    #[error("unknown resource codes: {}", .0.join(", "))]
    UnknownResourceCode(Vec<String>),

    #[error("{prefix}: undefined variables {} in '{original}' ({location})", .tokens.join(", "))]
    UnresolvedVariable {
        prefix: String,
        tokens: Vec<String>,
        original: String,
        location: String,
    },

    #[error("variable '{0}' must be a scalar value")]
    NonScalarVariable(String),

    #[error("JSON pointer '{0}' references a nonexistent value")]
    PointerNotFound(String),

    #[error("invalid JSON pointer '{0}': must be empty or start with '/'")]
    InvalidPointer(String),

    #[error("could not parse date '{0}'")]
    DateParse(String),

    #[error("command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EtlError {
    /// Wrap an error raised while executing `action`.
    pub fn in_action(action: &str, source: EtlError) -> Self {
        EtlError::ActionExecution {
            action: action.to_string(),
            source: Box::new(source),
        }
    }

    pub fn invalid_option(option: &str, message: impl Into<String>) -> Self {
        EtlError::InvalidOption {
            option: option.to_string(),
            message: message.into(),
        }
    }
}

fn format_tagged(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .map(|(name, msg)| format!("('{name}': {msg})"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, EtlError>;
