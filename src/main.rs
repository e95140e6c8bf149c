//! # Research Forge CLI (`rforge`)
//!
//! The `rforge` binary is the operator interface for Research Forge. It
//! provides commands for database initialization, reference ingestion,
//! queue management, running workers, and querying stored research.
//!
//! ## Usage
//!
//! ```bash
//! rforge --config ./config/rforge.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rforge init` | Create the SQLite database and run schema migrations |
//! | `rforge ingest <dir>` | Index reference documents for retrieval |
//! | `rforge enqueue <technique>` | Queue a research task |
//! | `rforge run` | Run a worker until stopped (or `--once` to drain) |
//! | `rforge search [query]` | Search stored research outputs |
//! | `rforge get <technique>` | Print a research document as JSON |
//! | `rforge archive <technique>` | Move a document to the archive |
//! | `rforge requeue <technique>` | Re-enqueue a terminally failed task |
//! | `rforge stats` | Show queue, index, and output statistics |

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use research_forge::queue::{RetryPolicy, TaskQueue};
use research_forge::store::{OutputStore, SearchFilters};
use research_forge::{config, db, generation, ingest, migrate, stats, worker};

/// Research Forge — a retrieval-augmented research store for cybersecurity
/// technique documentation.
#[derive(Parser)]
#[command(
    name = "rforge",
    about = "Research Forge — retrieval-augmented technique research",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rforge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Index reference documents from a directory.
    Ingest {
        /// Directory of reference material (markdown, text).
        path: PathBuf,
        /// Platform tag applied to every indexed chunk.
        #[arg(long)]
        platform: Option<String>,
    },

    /// Queue a research task for a (technique, platform) pair.
    ///
    /// Idempotent: while an active task exists for the pair, the existing
    /// task id is returned instead of creating a duplicate.
    Enqueue {
        /// Technique identifier (e.g. T1055).
        technique_id: String,
        /// Target platform (e.g. windows, linux, macos).
        #[arg(long)]
        platform: String,
        /// Human-readable technique name.
        #[arg(long, default_value = "")]
        name: String,
    },

    /// Run a research worker.
    Run {
        /// Exit once the queue is drained instead of polling forever.
        #[arg(long)]
        once: bool,
    },

    /// Search stored research outputs.
    Search {
        /// Full-text query; omit to list by quality.
        query: Option<String>,
        /// Filter by platform.
        #[arg(long)]
        platform: Option<String>,
        /// Filter by tag.
        #[arg(long)]
        tag: Option<String>,
        /// Minimum quality score (0–1).
        #[arg(long)]
        min_quality: Option<f64>,
        /// Only documents with this section populated.
        #[arg(long)]
        has_section: Option<String>,
        /// Maximum number of results.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Print a stored research document as JSON.
    Get {
        technique_id: String,
        #[arg(long)]
        platform: String,
    },

    /// Move a research document to the archive collection.
    Archive {
        technique_id: String,
        #[arg(long)]
        platform: String,
    },

    /// Re-enqueue a terminally failed task.
    Requeue {
        technique_id: String,
        #[arg(long)]
        platform: String,
    },

    /// Show queue, index, and output statistics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    let pool = db::connect(&config).await?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&pool).await?;
            println!("initialized {}", config.db.path.display());
        }

        Commands::Ingest { path, platform } => {
            ingest::run_ingest(&config, &pool, &path, platform.as_deref()).await?;
        }

        Commands::Enqueue {
            technique_id,
            platform,
            name,
        } => {
            let queue = TaskQueue::new(pool.clone(), RetryPolicy::from_config(&config.queue));
            let result = queue.enqueue(&technique_id, &name, &platform).await?;
            if result.created {
                println!("enqueued task {}", result.task_id);
            } else {
                println!("already queued as task {}", result.task_id);
            }
        }

        Commands::Run { once } => {
            if !config.generation.is_enabled() {
                anyhow::bail!(
                    "Command 'run' requires a generation provider. Set [generation] provider in config."
                );
            }

            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("shutdown requested, finishing current section...");
                    flag.store(true, Ordering::Relaxed);
                }
            });

            let generator = generation::create_generator(&config.generation)?;
            let worker = worker::Worker::new(config, pool.clone(), generator, shutdown)?;
            let processed = worker.run(once).await?;
            println!("processed {} task(s)", processed);
        }

        Commands::Search {
            query,
            platform,
            tag,
            min_quality,
            has_section,
            limit,
        } => {
            let store = OutputStore::new(pool.clone());
            let filters = SearchFilters {
                platform,
                tag,
                min_quality_score: min_quality,
                has_section,
            };
            let hits = store.search(query.as_deref(), &filters, limit).await?;

            if hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    let date = chrono::DateTime::from_timestamp(hit.last_updated, 0)
                        .map(|dt| dt.format("%Y-%m-%d").to_string())
                        .unwrap_or_default();
                    let name_display = if hit.technique_name.is_empty() {
                        "(unnamed)"
                    } else {
                        hit.technique_name.as_str()
                    };
                    println!(
                        "{}. {} / {} — {}",
                        i + 1,
                        hit.technique_id,
                        hit.platform,
                        name_display
                    );
                    println!(
                        "    quality: {:.2}  completeness: {:.2}  updated: {}",
                        hit.quality_score, hit.completeness_score, date
                    );
                    println!();
                }
            }
        }

        Commands::Get {
            technique_id,
            platform,
        } => {
            let store = OutputStore::new(pool.clone());
            let output = store.get(&technique_id, &platform).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }

        Commands::Archive {
            technique_id,
            platform,
        } => {
            let store = OutputStore::new(pool.clone());
            store.archive(&technique_id, &platform).await?;
            println!("archived {}/{}", technique_id, platform);
        }

        Commands::Requeue {
            technique_id,
            platform,
        } => {
            let queue = TaskQueue::new(pool.clone(), RetryPolicy::from_config(&config.queue));
            let task_id = queue.requeue(&technique_id, &platform).await?;
            println!("requeued as task {}", task_id);
        }

        Commands::Stats => {
            stats::run_stats(&config, &pool).await?;
        }
    }

    pool.close().await;
    Ok(())
}
