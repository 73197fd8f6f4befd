//! Database schema migrations.
//!
//! Creates all tables the worker reads and writes, and is safe to re-run:
//! every statement is `CREATE TABLE IF NOT EXISTS`. Invoked via
//! `docsyncd migrate`.
//!
//! # Schema
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `account` | Gating flags, subscription tier, quota counters |
//! | `integration_connection` | Per-account integration credentials (JSONB config) |
//! | `pipeline` | Pipeline definition with JSONB config (sources, embeddings, sinks) |
//! | `pipeline_run` | One scheduled execution: trigger, sync mode, change event |
//! | `pipeline_run_step` | Per-data-source status, keyed `(pipeline_run, data_source)` |
//! | `document` | Persisted mirror of upstream documents |
//!
//! Polymorphic columns (`config`, `integration_change_event`, `error`) hold
//! discriminator-tagged JSON; see `models` for the variant shapes.

use anyhow::Result;
use sqlx::PgPool;

/// Apply all DDL. Idempotent.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS account (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            name TEXT NOT NULL,
            is_suspended BOOLEAN NOT NULL DEFAULT FALSE,
            agree_to_terms BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_login_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            is_subscriber BOOLEAN NOT NULL DEFAULT FALSE,
            is_unlimited BOOLEAN NOT NULL DEFAULT FALSE,
            total_indexed_document_count BIGINT NOT NULL DEFAULT 0,
            total_indexed_document_tokens BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS integration_connection (
            account TEXT NOT NULL REFERENCES account(id),
            integration_name TEXT NOT NULL,
            connected_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            config JSONB NOT NULL,
            PRIMARY KEY (account, integration_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline (
            id TEXT PRIMARY KEY,
            account TEXT NOT NULL REFERENCES account(id),
            name TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ,
            config JSONB NOT NULL,
            is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
            is_default BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_run (
            id TEXT PRIMARY KEY,
            pipeline TEXT NOT NULL REFERENCES pipeline(id),
            trigger TEXT NOT NULL,
            sync_mode TEXT NOT NULL,
            integration_change_event JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_run_step (
            pipeline TEXT NOT NULL REFERENCES pipeline(id),
            pipeline_run TEXT NOT NULL REFERENCES pipeline_run(id),
            data_source TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            error JSONB,
            status TEXT NOT NULL DEFAULT 'pending',
            PRIMARY KEY (pipeline_run, data_source)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document (
            account TEXT NOT NULL REFERENCES account(id),
            pipeline TEXT NOT NULL REFERENCES pipeline(id),
            integration_name TEXT NOT NULL,
            document_type TEXT NOT NULL,
            id TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ,
            title TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            freshness_indicator TEXT,
            token_count BIGINT NOT NULL DEFAULT 0,
            exceeds_token_limit BOOLEAN NOT NULL DEFAULT FALSE,
            PRIMARY KEY (account, pipeline, integration_name, document_type, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The drift query scans by scope, not by primary key
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_document_scope
        ON document (account, pipeline, integration_name)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
