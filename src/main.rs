//! # Doc Intake CLI (`intake`)
//!
//! ## Usage
//!
//! ```bash
//! intake --config ./config/intake.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `intake init` | Create the SQLite database and run schema migrations |
//! | `intake run` | Process the input prefix once |
//! | `intake hash <ADDR>...` | Print content hashes of local files or S3 objects |
//! | `intake registry count\|lookup\|list` | Inspect the document registry |
//! | `intake check` | Validate and print the effective configuration |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`). Stdout carries only
//! command output, so `intake run --json` can be piped.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use doc_intake::config;
use doc_intake::db;
use doc_intake::migrate;
use doc_intake::orchestrator::{ClassificationOutcome, Orchestrator, RunSummary};
use doc_intake::progress::ProgressMode;
use doc_intake::registry::{DocumentRegistry, SqliteRegistry};
use doc_intake::storage::Storage;

/// Batch document intake: dedup, classify, extract and register files.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/intake.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "intake", version, about = "Batch document intake pipeline")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/intake.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file, the registry and the search index
    /// tables. Idempotent.
    Init,

    /// Run the pipeline once over the input prefix.
    ///
    /// Exits non-zero only when a whole stage fails; per-file and per-job
    /// failures are listed in the summary.
    Run {
        /// Only process files below this sub-prefix of the input prefix.
        #[arg(long)]
        folder: Option<String>,

        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,

        /// Progress on stderr. Defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Print the content hash of each address.
    Hash {
        /// Local paths or `s3://bucket/key` addresses.
        #[arg(required = true)]
        addresses: Vec<String>,
    },

    /// Inspect the document registry.
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Validate the configuration and print it with defaults filled in.
    Check,
}

#[derive(Subcommand)]
enum RegistryAction {
    /// Number of registered documents.
    Count,
    /// Look up entries by content hash.
    Lookup {
        #[arg(required = true)]
        hashes: Vec<String>,
    },
    /// Most recent entries.
    List {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Run {
            folder,
            json,
            progress,
        } => {
            let storage = Storage::from_config(&cfg.storage)?;
            let pool = db::connect(&cfg).await?;
            migrate::migrate_pool(&pool).await?;
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let orchestrator = Orchestrator::new(Arc::new(cfg), storage, pool.clone())
                .with_progress(Arc::from(mode.reporter()));

            let summary = orchestrator.run(folder.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            pool.close().await;
        }
        Commands::Hash { addresses } => {
            let storage = Storage::from_config(&cfg.storage)?;
            for address in addresses {
                let hash = storage.path(&address)?.content_hash().await?;
                println!("{}  {}", hash, address);
            }
        }
        Commands::Registry { action } => {
            let pool = db::connect(&cfg).await?;
            migrate::migrate_pool(&pool).await?;
            let registry = SqliteRegistry::new(pool.clone());
            match action {
                RegistryAction::Count => println!("{}", registry.count().await?),
                RegistryAction::Lookup { hashes } => {
                    let wanted: HashSet<String> = hashes.iter().map(|h| h.to_lowercase()).collect();
                    let found = registry.lookup(&wanted).await?;
                    for hash in &hashes {
                        match found.get(&hash.to_lowercase()) {
                            Some(entry) => println!("{}  {}  {}", hash, entry.id, entry.uri),
                            None => println!("{}  (not registered)", hash),
                        }
                    }
                }
                RegistryAction::List { limit } => {
                    for entry in registry.list(limit).await? {
                        println!("{}  {}  {}", entry.content_hash, entry.id, entry.uri);
                    }
                }
            }
            pool.close().await;
        }
        Commands::Check => {
            print!("{}", toml::to_string_pretty(&cfg)?);
            eprintln!("configuration ok: {}", cli.config.display());
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("run {}", summary.run_id);
    if let Some(workspace) = &summary.workspace {
        println!("  workspace: {}", workspace);
    }
    println!("  listed: {} ({} excluded)", summary.listed, summary.excluded);
    println!("  unsupported: {}", summary.unsupported.len());
    println!("  duplicates: {}", summary.duplicates.len());
    println!("  staged: {}", summary.staged);
    match &summary.classification {
        ClassificationOutcome::Skipped { reason } => println!("  classification: skipped ({})", reason),
        ClassificationOutcome::Completed { routed, labels } => {
            println!("  classification: {} routed [{}]", routed, labels.join(", "))
        }
        ClassificationOutcome::Failed { error } => println!("  classification: FAILED ({})", error),
    }
    for job in &summary.jobs {
        match (&job.report, &job.error) {
            (Some(report), _) => println!(
                "  job {}: {} rows, {} rejected, {} failed",
                job.name,
                report.rows,
                report.rejected,
                report.failures.len()
            ),
            (None, Some(error)) => println!("  job {}: FAILED ({})", job.name, error),
            (None, None) => println!("  job {}: no result", job.name),
        }
    }
    println!("  indexed: {}", summary.indexed);
    println!("  registered: {}", summary.registered);
    for failure in &summary.file_failures {
        println!("  left behind at {}: {} ({})", failure.stage, failure.file, failure.error);
    }
    println!("ok");
}
