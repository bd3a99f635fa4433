//! # Catalog Ingest CLI (`catalog-ingest`)
//!
//! Runs the job API and the queue worker, and offers a few commands for
//! submitting files and inspecting jobs from a terminal.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `catalog-ingest init` | Create the SQLite database and schema |
//! | `catalog-ingest serve` | Start the HTTP API (and a worker unless `--no-worker`) |
//! | `catalog-ingest worker` | Consume processing messages from the AMQP queue |
//! | `catalog-ingest submit <file>` | Create a job for a local CSV file |
//! | `catalog-ingest jobs` | List jobs, newest first |
//! | `catalog-ingest status <id>` | Show one job |
//! | `catalog-ingest stats` | Aggregate job statistics |
//!
//! ## Examples
//!
//! ```bash
//! catalog-ingest init --config ./config/ingest.toml
//! catalog-ingest serve --config ./config/ingest.toml
//! catalog-ingest submit ./products.csv --uploaded-by ops
//! catalog-ingest jobs --status failed --page-size 20
//! ```

use std::future::Future;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use catalog_ingest::app::App;
use catalog_ingest::config::{self, BrokerKind};
use catalog_ingest::migrate;
use catalog_ingest::models::{JobQuery, JobStatus};
use catalog_ingest::server;
use catalog_ingest::service::CreateJobRequest;

/// Bulk CSV ingestion for the product catalog.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ingest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "catalog-ingest",
    about = "Asynchronous bulk CSV ingestion for a product catalog",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ingest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP job API.
    ///
    /// A queue worker runs in the same process unless `--no-worker` is given.
    /// The local broker always needs the in-process worker.
    Serve {
        #[arg(long)]
        no_worker: bool,
    },

    /// Consume processing messages until interrupted. Requires the AMQP broker.
    Worker,

    /// Create a job for a CSV file and queue it. Requires the AMQP broker.
    Submit {
        /// Path to the CSV file.
        file: PathBuf,

        #[arg(long)]
        uploaded_by: Option<String>,
    },

    /// List jobs, newest first.
    Jobs {
        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 10)]
        page_size: u32,

        /// Filter by status name or numeric code.
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Show one job by id.
    Status { id: String },

    /// Aggregate job statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let broker_kind = cfg.broker.kind;
    let mut app = App::open(cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Serve { no_worker } => {
            if no_worker && broker_kind == BrokerKind::Local {
                bail!("the local broker has no external consumer; drop --no-worker or use kind = \"amqp\"");
            }
            let cancel = shutdown_token();
            let worker = if no_worker {
                None
            } else {
                Some(app.spawn_worker(cancel.clone()).await?)
            };

            server::run_server(app.config(), app.service(), cancel.clone()).await?;
            cancel.cancel();
            if let Some(worker) = worker {
                worker.await.context("worker task panicked")?;
            }
        }
        Commands::Worker => {
            require_amqp(broker_kind, "worker")?;
            let cancel = shutdown_token();
            println!("Worker consuming from queue '{}'", app.config().broker.queue);
            app.spawn_worker(cancel)
                .await?
                .await
                .context("worker task panicked")?;
        }
        Commands::Submit { file, uploaded_by } => {
            require_amqp(broker_kind, "submit")?;
            let csv_content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());

            let created = app
                .service()
                .create_job(CreateJobRequest {
                    file_name,
                    file_size_bytes: Some(csv_content.len() as u64),
                    csv_content,
                    uploaded_by,
                })
                .await?;
            print_json(&created)?;
        }
        Commands::Jobs {
            page,
            page_size,
            status,
        } => {
            let listing = app
                .service()
                .list_jobs(JobQuery {
                    page,
                    page_size,
                    status,
                })
                .await?;
            print_json(&listing)?;
        }
        Commands::Status { id } => {
            print_json(&app.service().get_job(&id).await?)?;
        }
        Commands::Stats => {
            print_json(&app.service().stats().await?)?;
        }
    }

    app.close().await;
    Ok(())
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), token.clone()));
    token
}

/// Cancels `token` once `signal` fires. A listener that fails to install
/// leaves the token alone so the process keeps running.
async fn cancel_on_signal(
    signal: impl Future<Output = std::io::Result<()>>,
    token: CancellationToken,
) {
    match signal.await {
        Ok(()) => {
            tracing::info!("shutdown requested");
            token.cancel();
        }
        Err(err) => tracing::error!(error = %err, "could not listen for Ctrl-C"),
    }
}

fn require_amqp(kind: BrokerKind, command: &str) -> anyhow::Result<()> {
    if kind != BrokerKind::Amqp {
        bail!(
            "`{}` needs a shared broker; set [broker] kind = \"amqp\" or use `serve`",
            command
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
