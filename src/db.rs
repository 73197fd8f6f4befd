//! PostgreSQL connection pool construction.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Connect to the database and build the shared pool.
///
/// The pool is sized for the worker fleet: each consumer plus the liveness
/// probe can hold a connection without starving the others. Connectivity is
/// verified by the initial connect; callers treat failure as fatal.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("unable to connect to database")?;

    Ok(pool)
}
