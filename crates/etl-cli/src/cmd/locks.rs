use crate::output::{print_json, print_table};
use clap::Args;
use etl_core::lock::list_records;
use etl_core::paths::DEFAULT_LOCK_FILE_PREFIX;
use std::path::PathBuf;

#[derive(Args)]
pub struct LocksArgs {
    /// Directory holding lock files (default: the system temp directory)
    #[arg(long, env = "ETL_LOCK_DIR")]
    lock_dir: Option<PathBuf>,

    #[arg(long, env = "ETL_LOCK_PREFIX", default_value = DEFAULT_LOCK_FILE_PREFIX)]
    lock_file_prefix: String,
}

pub fn run(args: LocksArgs, json: bool) -> anyhow::Result<()> {
    let dir = args.lock_dir.unwrap_or_else(std::env::temp_dir);
    let records = list_records(&dir, &args.lock_file_prefix)?;

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No lock files in {}.", dir.display());
        return Ok(());
    }
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
                if r.live { "live" } else { "stale" }.to_string(),
                r.actions.join(", "),
                r.path.display().to_string(),
            ]
        })
        .collect();
    print_table(&["PID", "STATUS", "ACTIONS", "PATH"], rows);
    Ok(())
}
