//! # docsync worker daemon (`docsyncd`)
//!
//! Long-lived process that consumes index jobs from the durable queue and
//! mirrors upstream documents into vector stores. Configuration comes from
//! the environment (see [`config`]); the only commands are:
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsyncd run` | Start the consumers and the liveness endpoint |
//! | `docsyncd migrate` | Apply the database schema and exit |
//!
//! ## Lifecycle
//!
//! `run` connects to PostgreSQL (fatal on failure), builds the source and
//! helper clients, starts `WORKER_COUNT` queue consumers, and serves
//! `GET /health` until SIGINT/SIGTERM. Shutdown cancels the root token;
//! consumers release their in-flight messages (visibility reset to 0) and
//! the process drains within 10 seconds before closing the pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use docsync::config::Config;
use docsync::handler::IndexHandler;
use docsync::helper::{DocumentHelper, HelperClient};
use docsync::models::Integration;
use docsync::queue::{start_consumer, JobQueue, MessageHandler, SqsQueue};
use docsync::source_linear::LinearClient;
use docsync::source_notion::NotionClient;
use docsync::sources::SourceRegistry;
use docsync::store::postgres::PgStore;
use docsync::store::Store;
use docsync::{db, migrate, server};

/// Grace period for consumers to release in-flight messages on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// docsync worker daemon.
///
/// All settings come from environment variables; see the module
/// documentation in `config` for the full list.
#[derive(Parser)]
#[command(
    name = "docsyncd",
    about = "docsync — distributed ingestion worker mirroring third-party documents into vector stores",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker: queue consumers plus the liveness endpoint.
    Run,

    /// Apply database schema migrations and exit.
    ///
    /// Idempotent — safe to run on every deploy before `run`.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Migrate => {
            let pool = db::connect(&config.database_url).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database schema applied.");
        }
        Commands::Run => run_worker(config).await?,
    }

    Ok(())
}

async fn run_worker(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone())?;

    let pool = db::connect(&config.database_url).await?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));

    let mut sources = SourceRegistry::new();
    sources.register(
        Integration::Notion,
        Arc::new(NotionClient::new(&config.notion_helper_endpoint)?),
    );
    sources.register(Integration::Linear, Arc::new(LinearClient::new()?));

    let helper: Arc<dyn DocumentHelper> =
        Arc::new(HelperClient::new(&config.document_helper_endpoint)?);

    let handler: Arc<dyn MessageHandler> = Arc::new(IndexHandler::new(
        store,
        sources,
        helper,
        &config.openai_api_key,
    ));

    let queue: Arc<dyn JobQueue> =
        Arc::new(SqsQueue::new(&config.index_queue_url, &config.aws_region)?);

    tracing::info!(
        workers = config.worker_count,
        queue_url = %config.index_queue_url,
        "starting consumers"
    );
    let consumers: Vec<_> = (0..config.worker_count)
        .map(|worker| start_consumer(worker, queue.clone(), handler.clone(), cancel.clone()))
        .collect();

    // Blocks until shutdown is signalled
    server::run_liveness_server(&config.bind_addr, cancel.clone()).await?;

    tracing::info!("draining consumers");
    let drain = async {
        for consumer in consumers {
            let _ = consumer.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!(
            grace_seconds = SHUTDOWN_GRACE.as_secs(),
            "consumers did not drain within the grace period"
        );
    }

    tracing::info!("closing database connection pool");
    pool.close().await;
    tracing::info!("shut down");

    Ok(())
}

/// Fire the root cancellation token on SIGINT or SIGTERM.
fn spawn_signal_listener(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("unable to install SIGTERM handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            tracing::info!("shutdown signal received, gracefully shutting down");
            cancel.cancel();
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, gracefully shutting down");
        cancel.cancel();
    });

    Ok(())
}
