use crate::cmd::{load_config, parse_pair};
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Args;
use etl_core::action::ActionRegistry;
use etl_core::etl_config::ConfigSettings;
use etl_core::overseer::{Overseer, RunSummary};
use etl_core::overseer_options::OverseerOptions;
use etl_core::variables::VariableStore;
use serde_json::{Map, Value};
use std::path::PathBuf;

#[derive(Args)]
pub struct RunArgs {
    /// ETL configuration file
    #[arg(long, short = 'c', env = "ETL_CONFIG")]
    config: PathBuf,

    /// Section to process (repeatable, comma-separated)
    #[arg(long = "section", short = 'p', value_delimiter = ',')]
    sections: Vec<String>,

    /// Single action as section.action or module.section.action (repeatable)
    #[arg(long = "action", short = 'a', value_delimiter = ',')]
    actions: Vec<String>,

    /// Start of the date window
    #[arg(long, short = 's')]
    start_date: Option<String>,

    /// End of the date window (a bare date means the end of that day)
    #[arg(long, short = 'e')]
    end_date: Option<String>,

    #[arg(long)]
    last_modified_start_date: Option<String>,

    #[arg(long)]
    last_modified_end_date: Option<String>,

    /// Days in the window, counting back from the end date
    #[arg(long, short = 'n')]
    number_of_days: Option<i64>,

    /// Split the window into chunks of this many days
    #[arg(long, short = 'k')]
    chunk_size_days: Option<u32>,

    /// Only process these resource codes
    #[arg(long = "only-resource", short = 'r', value_delimiter = ',')]
    include_only_resource_codes: Vec<String>,

    /// Skip these resource codes
    #[arg(long = "exclude-resource", short = 'x', value_delimiter = ',')]
    exclude_resource_codes: Vec<String>,

    /// Run disabled actions too
    #[arg(long, short = 'f')]
    force: bool,

    /// Verify and log, but do not modify anything
    #[arg(long)]
    dryrun: bool,

    /// Define a variable; wins over configuration values
    #[arg(long = "define", short = 'd', value_name = "NAME=VALUE")]
    defines: Vec<String>,

    /// Override an option on every action
    #[arg(long = "option", short = 'o', value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// Directory for lock files (default: the system temp directory)
    #[arg(long, env = "ETL_LOCK_DIR")]
    lock_dir: Option<PathBuf>,

    #[arg(long, env = "ETL_LOCK_PREFIX")]
    lock_file_prefix: Option<String>,
}

impl RunArgs {
    fn to_map(&self, verbose: bool) -> Map<String, Value> {
        let mut map = Map::new();
        let mut put = |key: &str, value: Value| {
            map.insert(key.to_string(), value);
        };
        let dates = [
            ("start-date", &self.start_date),
            ("end-date", &self.end_date),
            ("last-modified-start-date", &self.last_modified_start_date),
            ("last-modified-end-date", &self.last_modified_end_date),
        ];
        for (key, value) in dates {
            if let Some(v) = value {
                put(key, Value::String(v.clone()));
            }
        }
        if let Some(n) = self.number_of_days {
            put("number-of-days", n.into());
        }
        if let Some(k) = self.chunk_size_days {
            put("chunk-size-days", k.into());
        }
        put("force", self.force.into());
        put("dryrun", self.dryrun.into());
        put("verbose", verbose.into());
        put("include-only-resource-codes", strings(&self.include_only_resource_codes));
        put("exclude-resource-codes", strings(&self.exclude_resource_codes));
        put("actions", strings(&self.actions));
        put("process-sections", strings(&self.sections));
        if let Some(dir) = &self.lock_dir {
            put("lock-dir", Value::String(dir.display().to_string()));
        }
        if let Some(prefix) = &self.lock_file_prefix {
            put("lock-file-prefix", Value::String(prefix.clone()));
        }
        map
    }

    fn settings(&self) -> anyhow::Result<ConfigSettings> {
        let mut variables = VariableStore::new();
        for define in &self.defines {
            let (name, value) = parse_pair(define).context("invalid --define")?;
            variables.set(&name, value);
        }
        let option_overrides = self
            .options
            .iter()
            .map(|o| parse_pair(o).context("invalid --option"))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(ConfigSettings {
            variables,
            option_overrides,
            ..ConfigSettings::default()
        })
    }
}

fn strings(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub fn run(args: RunArgs, verbose: bool, json: bool) -> anyhow::Result<()> {
    let options = OverseerOptions::from_map(&args.to_map(verbose)).context("invalid run options")?;
    let config = load_config(&args.config, &args.settings()?)?;
    let registry = ActionRegistry::with_builtin();

    let mut overseer = Overseer::new(options, &config, &registry);
    let summary = overseer.run()?;

    if json {
        print_json(&summary)?;
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let mut rows: Vec<Vec<String>> = Vec::new();
    for name in &summary.executed {
        rows.push(vec![name.clone(), "done".into()]);
    }
    for name in &summary.failed {
        rows.push(vec![name.clone(), "failed".into()]);
    }
    for name in &summary.skipped {
        rows.push(vec![name.clone(), "disabled".into()]);
    }
    if !rows.is_empty() {
        print_table(&["ACTION", "STATUS"], rows);
    }
    println!(
        "run {}: {} executed, {} failed, {} skipped over {} chunk(s){}",
        summary.run_id,
        summary.executed.len(),
        summary.failed.len(),
        summary.skipped.len(),
        summary.chunks.len(),
        if summary.dryrun { " (dryrun)" } else { "" }
    );
}
