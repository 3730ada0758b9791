use crate::error::{EtlError, Result};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Configuration keys
// ---------------------------------------------------------------------------

/// Keys starting with this sentinel are comments and never reach a section.
pub const COMMENT_PREFIX: &str = "#";
pub const INCLUDE_KEY: &str = "include";
pub const REFERENCE_KEY: &str = "$ref";

pub const DEFAULTS_KEY: &str = "defaults";
pub const ENDPOINTS_KEY: &str = "endpoints";
pub const PATHS_KEY: &str = "paths";
pub const GLOBAL_KEY: &str = "global";
pub const VARIABLES_KEY: &str = "variables";
pub const MODULE_KEY: &str = "module";

pub const RESERVED_KEYS: &[&str] = &[
    DEFAULTS_KEY,
    ENDPOINTS_KEY,
    PATHS_KEY,
    GLOBAL_KEY,
    VARIABLES_KEY,
    MODULE_KEY,
];

pub const BASE_DIR_KEY: &str = "base_dir";
pub const LOCAL_CONFIG_DIR_KEY: &str = "local_config_dir";
pub const ACTION_DEFINITION_DIR_KEY: &str = "action_definition_dir";
pub const DATA_DIR_KEY: &str = "data_dir";

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

pub const DEFAULT_MODULE: &str = "etl";
pub const DEFAULT_LOCK_FILE_PREFIX: &str = "etl-overseer-";

/// Separates module, section and action in a qualified name.
pub const NAME_SEPARATOR: char = '.';

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_\-]*$").unwrap())
}

/// Section, action and module names are single path-free tokens; dots are
/// reserved for qualification.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.len() > 128 || !name_re().is_match(name) {
        return Err(EtlError::ConfigInvalid(format!(
            "invalid {kind} name '{name}': use letters, digits, '_' or '-' (no '.')"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Make `path` absolute against the current directory and normalize it.
pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        normalize(&cwd.join(path))
    }
}

/// Directory a configuration file's relative references resolve against.
pub fn base_dir_of(file: &Path) -> PathBuf {
    let file = absolutize(file);
    file.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn qualify_path(path: &str, base: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        normalize(p)
    } else {
        normalize(&base.join(p))
    }
}

/// Lexically remove `.` and `..` components without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_reject_dots_and_blanks() {
        assert!(validate_name("section", "jobs").is_ok());
        assert!(validate_name("action", "ingest-users_2").is_ok());
        assert!(validate_name("section", "a.b").is_err());
        assert!(validate_name("section", "").is_err());
        assert!(validate_name("section", "has space").is_err());
    }

    #[test]
    fn qualify_relative_against_base() {
        let q = qualify_path("../data/x.json", Path::new("/etc/etl/conf"));
        assert_eq!(q, PathBuf::from("/etc/etl/data/x.json"));
    }

    #[test]
    fn qualify_keeps_absolute() {
        let q = qualify_path("/var/lib/./x", Path::new("/etc"));
        assert_eq!(q, PathBuf::from("/var/lib/x"));
    }

    #[test]
    fn base_dir_of_relative_file_is_absolute() {
        let base = base_dir_of(Path::new("etl.json"));
        assert!(base.is_absolute());
    }
}
