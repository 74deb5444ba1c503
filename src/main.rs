//! # Atlas CLI (`atlas`)
//!
//! ## Usage
//!
//! ```bash
//! atlas [--config ./config/atlas.toml] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `atlas init` | Create queue directories, the database and the search index |
//! | `atlas worker` | Run the processor loop |
//! | `atlas poll-gmail` | Enqueue new messages from the configured Gmail labels |
//! | `atlas poll-rss` | Enqueue new entries from the configured feeds |
//! | `atlas process-backlog` | Replay the backlog manifest |
//! | `atlas ingest-url <url>` | Enqueue one URL |
//! | `atlas ingest-trojanhorse [file]` | Enqueue a JSON payload from a file or stdin |
//! | `atlas requeue <id>` | Move a failed job back to the inbox |
//! | `atlas status` | Queue counts, store totals, recent failures |
//! | `atlas search "<query>"` | Full-text search |
//! | `atlas get <id>` | Show one content row and its audit history |
//! | `atlas serve` | Start the HTTP API |
//!
//! Logs go to stderr; set `RUST_LOG` (default `atlas=info`) to change the
//! level. A `.env` file in the working directory is loaded first.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use atlas::config::{load_config, Config};
use atlas::queue::Queue;
use atlas::{
    adapter_backlog, adapter_gmail, adapter_rss, adapter_trojanhorse, adapter_url, content,
    migrate, queue, search, server, status, worker,
};

/// Atlas: queue-based content ingestion with full-text search.
#[derive(Parser)]
#[command(name = "atlas", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    ///
    /// Defaults to `./config/atlas.toml` when that file exists. Environment
    /// variables override file values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create queue directories, the database schema and the search index.
    ///
    /// Idempotent: running it again changes nothing.
    Init,

    /// Run the processor loop.
    Worker {
        /// Stop after this many iterations (one claim attempt each).
        #[arg(long)]
        max_iterations: Option<u64>,
    },

    /// Enqueue new messages from the configured Gmail labels.
    PollGmail,

    /// Enqueue new entries from the feeds listed in RSS_CONFIG_PATH.
    PollRss,

    /// Replay the sources listed in BACKLOG_CONFIG_PATH.
    ProcessBacklog,

    /// Enqueue a single URL.
    IngestUrl {
        url: String,

        /// Source label stored with the content (default: manual).
        #[arg(long)]
        source: Option<String>,
    },

    /// Enqueue an arbitrary JSON payload.
    IngestTrojanhorse {
        /// JSON file to read; `-` or omitted reads stdin.
        file: Option<PathBuf>,

        #[arg(long)]
        source: Option<String>,

        /// Free-form note attached to the job.
        #[arg(long)]
        notes: Option<String>,
    },

    /// Move a failed job back to the inbox.
    Requeue { id: String },

    /// Show queue counts, store totals and recent failures.
    Status,

    /// Full-text search over processed content.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<i64>,
    },

    /// Show one content row by job id.
    Get { id: String },

    /// Start the HTTP API on server.bind (ATLAS_BIND).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("atlas=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            init(&cfg).await?;
            println!("Atlas initialized successfully.");
        }
        Commands::Worker { max_iterations } => {
            worker::run_worker(&cfg, max_iterations).await?;
        }
        Commands::PollGmail => {
            adapter_gmail::run_poll_gmail(&cfg).await?;
        }
        Commands::PollRss => {
            adapter_rss::run_poll_rss(&cfg).await?;
        }
        Commands::ProcessBacklog => {
            adapter_backlog::run_process_backlog(&cfg).await?;
        }
        Commands::IngestUrl { url, source } => {
            adapter_url::run_ingest_url(&cfg, &url, source.as_deref())?;
        }
        Commands::IngestTrojanhorse {
            file,
            source,
            notes,
        } => {
            adapter_trojanhorse::run_ingest_trojanhorse(
                &cfg,
                file.as_deref(),
                source.as_deref(),
                notes,
            )?;
        }
        Commands::Requeue { id } => {
            queue::run_requeue(&cfg, &id)?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Get { id } => {
            content::run_get(&cfg, &id).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn init(cfg: &Config) -> Result<()> {
    Queue::open(&cfg.paths.queue_root)?;
    for dir in [&cfg.paths.archive_root, &cfg.paths.raw_root] {
        std::fs::create_dir_all(dir)?;
    }
    if let Some(parent) = cfg.db.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    migrate::run_migrations(cfg).await
}
