//! Command-line entry point: runs a concurrent workload against the page
//! cache and prints the report as JSON.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stratum::{BufferPoolConfig, Database};
use stratum_bin::workload::{self, WorkloadConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stratum", version, about)]
struct CommandLine {
    /// Directory holding the table files. A scratch directory is used when
    /// unset.
    #[arg(long, env = "STRATUM_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,
    /// JSON buffer pool configuration.
    #[arg(long, env = "STRATUM_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Overrides the configured cache capacity, in pages.
    #[arg(long, global = true)]
    capacity: Option<usize>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the workload and print its report.
    Run {
        #[command(flatten)]
        workload: WorkloadConfig,
        #[arg(long)]
        pretty: bool,
    },
    /// Print the effective buffer pool configuration.
    Config,
}

fn load_config(args: &CommandLine) -> anyhow::Result<BufferPoolConfig> {
    let mut config = match &args.config {
        Some(path) => BufferPoolConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => BufferPoolConfig::default(),
    };
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
        config.validate()?;
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = CommandLine::parse();
    let config = load_config(&args)?;

    match args.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Run { workload, pretty } => {
            let (data_dir, _scratch) = match args.data_dir {
                Some(dir) => (dir, None),
                None => {
                    let scratch = tempfile::tempdir().context("creating scratch directory")?;
                    (scratch.path().to_path_buf(), Some(scratch))
                }
            };
            info!(data_dir = %data_dir.display(), capacity = config.capacity, "starting workload");

            let db = Database::new(config)?;
            let table_id = workload::prepare(&db, &data_dir, workload.pages)?;
            let report = workload::run(&db, table_id, &workload)?;
            db.pool().flush_all_pages()?;

            let json = if pretty {
                serde_json::to_string_pretty(&report)?
            } else {
                serde_json::to_string(&report)?
            };
            println!("{json}");
        }
    }
    Ok(())
}
