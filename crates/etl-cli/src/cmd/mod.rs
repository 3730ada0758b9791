pub mod chunks;
pub mod list;
pub mod locks;
pub mod run;

use anyhow::Context;
use etl_core::endpoint::EndpointRegistry;
use etl_core::etl_config::{ConfigSettings, EtlConfiguration};
use std::path::Path;

/// Load `path` with the built-in endpoint types.
pub fn load_config(path: &Path, settings: &ConfigSettings) -> anyhow::Result<EtlConfiguration> {
    EtlConfiguration::load(path, &EndpointRegistry::with_builtin(), settings)
        .with_context(|| format!("failed to load configuration {}", path.display()))
}

/// Split `NAME=VALUE`.
pub fn parse_pair(arg: &str) -> anyhow::Result<(String, String)> {
    match arg.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => anyhow::bail!("expected NAME=VALUE, got '{arg}'"),
    }
}
