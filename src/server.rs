//! Liveness HTTP endpoint.
//!
//! Serves `GET /health` → `ok` for orchestration probes. This is the only
//! HTTP surface the worker exposes; all real work arrives via the queue.
//! The server shuts down gracefully when the root cancellation token fires.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;

/// Run the liveness server until `cancel` fires.
pub async fn run_liveness_server(bind_addr: &str, cancel: CancellationToken) -> Result<()> {
    let app = Router::new().route("/health", get(handle_health));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("unable to bind liveness listener on {}", bind_addr))?;

    tracing::info!(bind_addr, "liveness endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("liveness server failed")?;

    tracing::info!("liveness endpoint shut down");
    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}
