//! Process configuration.
//!
//! The worker is configured entirely through environment variables so it can
//! run unchanged under any orchestrator. Missing required variables are fatal
//! at startup; nothing is re-read after boot.
//!
//! | Variable | Required | Purpose |
//! |----------|----------|---------|
//! | `DATABASE_URL` | yes | PostgreSQL connection string |
//! | `INDEX_QUEUE_URL` | yes | URL of the index job queue |
//! | `AWS_REGION` | yes | Signing region for queue requests |
//! | `NOTION_HELPER_ENDPOINT` | yes | Markdown sidecar base URL |
//! | `DOCUMENT_HELPER_ENDPOINT` | yes | Embedding/vector helper base URL |
//! | `OPENAI_API_KEY` | yes | Forwarded to the helper on ingest |
//! | `WORKER_COUNT` | no | Parallel queue consumers (default 4) |
//! | `BIND_ADDR` | no | Liveness listener (default `0.0.0.0:8080`) |
//!
//! Queue signing credentials (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
//! optional `AWS_SESSION_TOKEN`) are read by the queue client itself when it
//! is constructed.

use anyhow::{Context, Result};

/// Default number of parallel queue consumers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Validated worker configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Full URL of the index job queue.
    pub index_queue_url: String,
    /// Signing region for queue requests.
    pub aws_region: String,
    /// Base URL of the markdown sidecar used for knowledge-base content.
    pub notion_helper_endpoint: String,
    /// Base URL of the embedding/vector-store helper.
    pub document_helper_endpoint: String,
    /// API key forwarded to the helper for embedding calls.
    pub openai_api_key: String,
    /// Number of parallel queue consumers.
    pub worker_count: usize,
    /// Bind address for the liveness endpoint.
    pub bind_addr: String,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing required variable, or an
    /// unparsable `WORKER_COUNT`.
    pub fn from_env() -> Result<Self> {
        let worker_count = match std::env::var("WORKER_COUNT") {
            Ok(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("WORKER_COUNT is not a number: {:?}", raw))?,
            Err(_) => DEFAULT_WORKER_COUNT,
        };

        Ok(Self {
            database_url: require("DATABASE_URL")?,
            index_queue_url: require("INDEX_QUEUE_URL")?,
            aws_region: require("AWS_REGION")?,
            notion_helper_endpoint: require("NOTION_HELPER_ENDPOINT")?,
            document_helper_endpoint: require("DOCUMENT_HELPER_ENDPOINT")?,
            openai_api_key: require("OPENAI_API_KEY")?,
            worker_count,
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        })
    }
}

fn require(name: &str) -> Result<String> {
    let value =
        std::env::var(name).with_context(|| format!("{} environment variable not set", name))?;
    if value.is_empty() {
        anyhow::bail!("{} environment variable is empty", name);
    }
    Ok(value)
}
