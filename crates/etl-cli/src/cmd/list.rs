use crate::cmd::load_config;
use crate::output::{print_json, print_table, yes_no};
use clap::Subcommand;
use etl_core::action::ActionRegistry;
use etl_core::etl_config::{ConfigSettings, EtlConfiguration};
use serde_json::json;
use std::path::Path;

#[derive(Subcommand)]
pub enum ListSubcommand {
    /// Sections in file order
    Sections,

    /// Actions of one section, or of every section
    Actions {
        /// Section name (module prefix optional)
        section: Option<String>,
    },

    /// Data endpoints and the global names that refer to them
    Endpoints,
}

pub fn run(config: &Path, subcmd: ListSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(config, &ConfigSettings::default())?;
    match subcmd {
        ListSubcommand::Sections => sections(&config, json),
        ListSubcommand::Actions { section } => actions(&config, section.as_deref(), json),
        ListSubcommand::Endpoints => endpoints(&config, json),
    }
}

fn sections(config: &EtlConfiguration, json: bool) -> anyhow::Result<()> {
    if json {
        let list: Vec<_> = config
            .sections()
            .iter()
            .map(|s| {
                json!({
                    "name": s.name(),
                    "actions": s.actions().len(),
                    "enabled": s.actions().iter().filter(|a| a.enabled).count(),
                })
            })
            .collect();
        return print_json(&list);
    }
    let rows = config
        .sections()
        .iter()
        .map(|s| {
            vec![
                s.name().to_string(),
                s.actions().len().to_string(),
                s.actions().iter().filter(|a| a.enabled).count().to_string(),
            ]
        })
        .collect();
    print_table(&["SECTION", "ACTIONS", "ENABLED"], rows);
    Ok(())
}

fn actions(config: &EtlConfiguration, section: Option<&str>, json: bool) -> anyhow::Result<()> {
    let selected: Vec<_> = match section {
        Some(name) => {
            let Some(section) = config.section(name) else {
                anyhow::bail!("section '{}' not found", config.qualify_section_name(name));
            };
            vec![section]
        }
        None => config.sections().iter().collect(),
    };
    let actions: Vec<_> = selected.iter().flat_map(|s| s.actions()).collect();

    if json {
        let list: Vec<_> = actions
            .iter()
            .map(|a| {
                json!({
                    "name": a.name,
                    "section": a.section,
                    "class": ActionRegistry::resolve_class_name(a),
                    "enabled": a.enabled,
                    "description": a.description,
                })
            })
            .collect();
        return print_json(&list);
    }
    let rows = actions
        .iter()
        .map(|a| {
            vec![
                a.name.clone(),
                ActionRegistry::resolve_class_name(a),
                yes_no(a.enabled),
                a.description.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["ACTION", "CLASS", "ENABLED", "DESCRIPTION"], rows);
    Ok(())
}

fn endpoints(config: &EtlConfiguration, json: bool) -> anyhow::Result<()> {
    let globals = |key: &str| -> Vec<String> {
        config
            .global_endpoint_names()
            .filter(|name| {
                config
                    .global_endpoint(name)
                    .is_some_and(|e| e.key() == key)
            })
            .map(str::to_string)
            .collect()
    };

    if json {
        let list: Vec<_> = config
            .data_endpoints()
            .map(|e| {
                json!({
                    "key": e.key(),
                    "name": e.name(),
                    "type": e.endpoint_type(),
                    "global": globals(e.key()),
                })
            })
            .collect();
        return print_json(&list);
    }
    let rows = config
        .data_endpoints()
        .map(|e| {
            vec![
                e.key().to_string(),
                e.endpoint_type().to_string(),
                globals(e.key()).join(", "),
            ]
        })
        .collect();
    print_table(&["KEY", "TYPE", "GLOBAL"], rows);
    Ok(())
}
