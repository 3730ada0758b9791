mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{chunks::ChunksArgs, list::ListSubcommand, locks::LocksArgs, run::RunArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "etl-overseer",
    about = "Run ETL sections and actions over date windows, one process per action at a time",
    version,
    propagate_version = true
)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// More logging (repeat for more)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Less logging
    #[arg(long, short = 'q', global = true, action = clap::ArgAction::Count)]
    quiet: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify, lock and execute the requested sections and actions
    Run(RunArgs),

    /// Inspect an ETL configuration
    List {
        /// ETL configuration file
        #[arg(long, short = 'c', env = "ETL_CONFIG")]
        config: PathBuf,

        #[command(subcommand)]
        subcommand: ListSubcommand,
    },

    /// Show how a date window is split into chunks
    Chunks(ChunksArgs),

    /// Show lock files and whether their owners are still running
    Locks(LocksArgs),
}

/// Index into ERROR..TRACE: run logs progress at info, everything else at warn.
fn log_level(command: &Commands, verbose: u8, quiet: u8) -> tracing::Level {
    const LEVELS: [tracing::Level; 5] = [
        tracing::Level::ERROR,
        tracing::Level::WARN,
        tracing::Level::INFO,
        tracing::Level::DEBUG,
        tracing::Level::TRACE,
    ];
    let base: u8 = match command {
        Commands::Run(_) => 2,
        _ => 1,
    };
    let idx = base.saturating_add(verbose).saturating_sub(quiet).min(4);
    LEVELS[idx as usize]
}

fn main() {
    let cli = Cli::parse();

    let default_level = log_level(&cli.command, cli.verbose, cli.quiet);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run(args) => cmd::run::run(args, cli.verbose > 0, cli.json),
        Commands::List { config, subcommand } => cmd::list::run(&config, subcommand, cli.json),
        Commands::Chunks(args) => cmd::chunks::run(args, cli.json),
        Commands::Locks(args) => cmd::locks::run(args, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
