//! Streamload - stream-monitoring data loader

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use streamload_common::logging::{init_logging, LogConfig, LogLevel};
use streamload_ingest::quarantine::{QuarantineFilter, QuarantineSink, SqliteQuarantineSink};
use streamload_ingest::store::{SqliteTargetStore, TargetStore};
use streamload_ingest::types::ReasonCode;
use streamload_ingest::{Pipeline, PipelineConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "streamload")]
#[command(author, version, about = "Load stream-monitoring exports into the StreamWatch store")]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, env = "STREAMLOAD_CONFIG", default_value = "streamload.toml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline over every configured source
    Run {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load and validate the configuration, then exit
    Validate,

    /// Inspect or clear quarantined records
    Quarantine {
        #[command(subcommand)]
        command: QuarantineCommand,
    },

    /// Inspect or reset load checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
}

#[derive(Subcommand, Debug)]
enum QuarantineCommand {
    /// List quarantined records
    List {
        #[arg(long)]
        entity: Option<String>,

        /// Reason code, e.g. orphaned-reference
        #[arg(long)]
        reason: Option<ReasonCode>,

        #[arg(long)]
        source: Option<String>,

        /// First source row to include
        #[arg(long)]
        from_row: Option<u64>,

        /// Last source row to include
        #[arg(long)]
        to_row: Option<u64>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Remove entries after they have been reprocessed
    Clear {
        /// Entry ids
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointCommand {
    /// Show every stored checkpoint
    Show,

    /// Drop a checkpoint so the next run reloads the source from the start
    Reset {
        #[arg(long)]
        entity: String,

        #[arg(long)]
        source: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    match execute(&cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            process::exit(1);
        },
    }
}

async fn execute(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Command::Run { json } => run(&cli.config, *json).await,
        Command::Validate => {
            let config = load_config(&cli.config)?;
            let catalog = config.catalog()?;
            println!("Configuration {} is valid", cli.config.display());
            for (depth, level) in catalog.levels().iter().enumerate() {
                println!("  level {}: {}", depth, level.join(", "));
            }
            println!("  sources: {}", config.sources.len());
            Ok(0)
        },
        Command::Quarantine { command } => quarantine(&cli.config, command).await,
        Command::Checkpoint { command } => checkpoint(&cli.config, command).await,
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn run(config_path: &Path, json: bool) -> Result<i32> {
    let config = load_config(config_path)?;
    let pipeline = Pipeline::builder(config)
        .build()
        .await
        .context("Failed to set up pipeline")?;

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next chunk boundary");
            cancel.cancel();
        }
    });

    let report = pipeline.run_configured().await.context("Pipeline run failed")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    info!(run_id = %report.run_id, exit_code = report.exit_code(), "Done");
    Ok(report.exit_code())
}

async fn quarantine(config_path: &Path, command: &QuarantineCommand) -> Result<i32> {
    let config = load_config(config_path)?;
    let sink = SqliteQuarantineSink::open(&config.quarantine.path)
        .context("Failed to open quarantine database")?;

    match command {
        QuarantineCommand::List {
            entity,
            reason,
            source,
            from_row,
            to_row,
            limit,
            json,
        } => {
            let filter = QuarantineFilter {
                entity: entity.clone(),
                reason: *reason,
                source_id: source.clone(),
                row_from: *from_row,
                row_to: *to_row,
                limit: *limit,
            };
            let entries = sink.list(&filter).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!(
                        "{:>6}  {:<12} {:<22} {:<14} {}  {}",
                        entry.id.unwrap_or_default(),
                        entry.entity,
                        entry.reason,
                        entry.stage.as_str(),
                        entry.provenance(),
                        entry.detail.as_deref().unwrap_or("")
                    );
                }
                println!("{} entries", entries.len());
            }
        },
        QuarantineCommand::Clear { ids } => {
            let removed = sink.clear(ids).await?;
            println!("Removed {} of {} entries", removed, ids.len());
        },
    }
    Ok(0)
}

async fn checkpoint(config_path: &Path, command: &CheckpointCommand) -> Result<i32> {
    let config = load_config(config_path)?;
    let store = SqliteTargetStore::connect(&config.store.database_url, config.store.max_connections)
        .await
        .context("Failed to connect to target store")?;

    match command {
        CheckpointCommand::Show => {
            let checkpoints = store.list_checkpoints().await?;
            if checkpoints.is_empty() {
                println!("No checkpoints");
            }
            for cp in checkpoints {
                println!(
                    "{:<12} {:<20} offset={:<8} chunk={:<5} last_key={}  ({})",
                    cp.entity,
                    cp.source_id,
                    cp.offset,
                    cp.chunk_index,
                    cp.last_key,
                    cp.updated_at.to_rfc3339()
                );
            }
        },
        CheckpointCommand::Reset { entity, source } => {
            if store.clear_checkpoint(entity, source).await? {
                println!("Checkpoint for {}/{} removed", entity, source);
            } else {
                println!("No checkpoint for {}/{}", entity, source);
            }
        },
    }
    Ok(0)
}
