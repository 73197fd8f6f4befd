//! PostgreSQL [`Store`] implementation.
//!
//! Row-level functions are generic over [`sqlx::PgExecutor`], so they accept
//! the shared pool, a single connection, or an open transaction. The
//! [`PgStore`] wrapper implements the [`Store`] trait against the pool; code
//! that needs transactional grouping can call the row functions directly
//! with `&mut *tx`.
//!
//! Counter updates are single additive `UPDATE` statements — the database
//! serializes concurrent increments, so no worker ever reads a counter
//! before writing it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};

use crate::models::{
    Account, Document, Integration, IntegrationConnection, Pipeline, PipelineRun,
    PipelineRunStep, RunError, StepStatus,
};

use super::Store;

/// [`Store`] backed by the shared PostgreSQL pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Decode a TEXT column holding a serde-tagged scalar (trigger, sync mode).
fn decode_scalar<T: serde::de::DeserializeOwned>(raw: String) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.clone()))
        .with_context(|| format!("unrecognized value: {:?}", raw))
}

// ============ Accounts ============

pub async fn get_account<'e, E: PgExecutor<'e>>(
    executor: E,
    account_id: &str,
) -> Result<Option<Account>> {
    let row = sqlx::query(
        r#"
        SELECT id, email, name, is_suspended, agree_to_terms, created_at, last_login_at,
               is_subscriber, is_unlimited, total_indexed_document_count, total_indexed_document_tokens
        FROM account
        WHERE id = $1
        "#,
    )
    .bind(account_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| {
        Ok(Account {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            name: row.try_get("name")?,
            is_suspended: row.try_get("is_suspended")?,
            agree_to_terms: row.try_get("agree_to_terms")?,
            created_at: row.try_get("created_at")?,
            last_login_at: row.try_get("last_login_at")?,
            is_subscriber: row.try_get("is_subscriber")?,
            is_unlimited: row.try_get("is_unlimited")?,
            total_indexed_document_count: row.try_get("total_indexed_document_count")?,
            total_indexed_document_tokens: row.try_get("total_indexed_document_tokens")?,
        })
    })
    .transpose()
}

pub async fn suspend_account<'e, E: PgExecutor<'e>>(executor: E, account_id: &str) -> Result<()> {
    sqlx::query("UPDATE account SET is_suspended = TRUE WHERE id = $1")
        .bind(account_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Additive update: concurrent workers never lose counts.
pub async fn increase_total_indexed_count<'e, E: PgExecutor<'e>>(
    executor: E,
    account_id: &str,
    delta: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE account SET total_indexed_document_count = total_indexed_document_count + $2 WHERE id = $1",
    )
    .bind(account_id)
    .bind(delta)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn increase_total_document_tokens<'e, E: PgExecutor<'e>>(
    executor: E,
    account_id: &str,
    delta: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE account SET total_indexed_document_tokens = total_indexed_document_tokens + $2 WHERE id = $1",
    )
    .bind(account_id)
    .bind(delta)
    .execute(executor)
    .await?;
    Ok(())
}

// ============ Pipelines ============

pub async fn get_pipeline<'e, E: PgExecutor<'e>>(
    executor: E,
    pipeline_id: &str,
) -> Result<Option<Pipeline>> {
    let row = sqlx::query(
        r#"
        SELECT id, account, name, created_at, updated_at, config, is_enabled, is_default
        FROM pipeline
        WHERE id = $1
        "#,
    )
    .bind(pipeline_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| {
        let config: serde_json::Value = row.try_get("config")?;
        Ok(Pipeline {
            id: row.try_get("id")?,
            account: row.try_get("account")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            config: serde_json::from_value(config).context("undecodable pipeline config")?,
            is_enabled: row.try_get("is_enabled")?,
            is_default: row.try_get("is_default")?,
        })
    })
    .transpose()
}

pub async fn get_integration_connection<'e, E: PgExecutor<'e>>(
    executor: E,
    account_id: &str,
    integration: Integration,
) -> Result<Option<IntegrationConnection>> {
    let row = sqlx::query(
        r#"
        SELECT account, integration_name, connected_at, config
        FROM integration_connection
        WHERE account = $1 AND integration_name = $2
        "#,
    )
    .bind(account_id)
    .bind(integration.as_str())
    .fetch_optional(executor)
    .await?;

    row.map(|row| {
        let connected_at: DateTime<Utc> = row.try_get("connected_at")?;
        let integration_name: String = row.try_get("integration_name")?;
        let config: serde_json::Value = row.try_get("config")?;

        let combined = serde_json::json!({
            "integration_name": integration_name,
            "account": row.try_get::<String, _>("account")?,
            "connected_at": connected_at.to_rfc3339(),
            "config": config,
        });
        serde_json::from_value(combined).context("undecodable integration connection")
    })
    .transpose()
}

// ============ Runs & steps ============

pub async fn get_pipeline_run<'e, E: PgExecutor<'e>>(
    executor: E,
    run_id: &str,
) -> Result<Option<PipelineRun>> {
    let row = sqlx::query(
        r#"
        SELECT id, pipeline, trigger, sync_mode, integration_change_event, created_at, updated_at
        FROM pipeline_run
        WHERE id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| {
        let change_event: Option<serde_json::Value> = row.try_get("integration_change_event")?;
        Ok(PipelineRun {
            id: row.try_get("id")?,
            pipeline: row.try_get("pipeline")?,
            trigger: decode_scalar(row.try_get("trigger")?)?,
            sync_mode: decode_scalar(row.try_get("sync_mode")?)?,
            integration_change_event: change_event
                .map(serde_json::from_value)
                .transpose()
                .context("undecodable integration change event")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    })
    .transpose()
}

fn step_from_row(row: &PgRow) -> Result<PipelineRunStep> {
    let error: Option<serde_json::Value> = row.try_get("error")?;
    let status: String = row.try_get("status")?;
    Ok(PipelineRunStep {
        pipeline: row.try_get("pipeline")?,
        pipeline_run: row.try_get("pipeline_run")?,
        data_source: row.try_get("data_source")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: error
            .map(serde_json::from_value)
            .transpose()
            .context("undecodable step error")?,
        status: status.parse()?,
    })
}

pub async fn get_pipeline_step<'e, E: PgExecutor<'e>>(
    executor: E,
    run_id: &str,
    data_source_id: &str,
) -> Result<Option<PipelineRunStep>> {
    let row = sqlx::query(
        r#"
        SELECT pipeline, pipeline_run, data_source, created_at, started_at, completed_at, error, status
        FROM pipeline_run_step
        WHERE pipeline_run = $1 AND data_source = $2
        "#,
    )
    .bind(run_id)
    .bind(data_source_id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(step_from_row).transpose()
}

pub async fn update_pipeline_run_step<'e, E: PgExecutor<'e>>(
    executor: E,
    run_id: &str,
    data_source_id: &str,
    status: StepStatus,
    error: Option<&RunError>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<()> {
    let error_json = error.map(serde_json::to_value).transpose()?;

    sqlx::query(
        r#"
        UPDATE pipeline_run_step
        SET status = $3, error = $4, started_at = $5, completed_at = $6
        WHERE pipeline_run = $1 AND data_source = $2
        "#,
    )
    .bind(run_id)
    .bind(data_source_id)
    .bind(status.as_str())
    .bind(error_json)
    .bind(started_at)
    .bind(completed_at)
    .execute(executor)
    .await?;
    Ok(())
}

// ============ Documents ============

fn document_from_row(row: &PgRow) -> Result<Document> {
    let integration: String = row.try_get("integration_name")?;
    Ok(Document {
        account: row.try_get("account")?,
        pipeline: row.try_get("pipeline")?,
        integration: integration.parse()?,
        document_type: row.try_get("document_type")?,
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        freshness_indicator: row.try_get("freshness_indicator")?,
        token_count: row.try_get("token_count")?,
        exceeds_token_limit: row.try_get("exceeds_token_limit")?,
    })
}

pub async fn get_document<'e, E: PgExecutor<'e>>(
    executor: E,
    account_id: &str,
    pipeline_id: &str,
    integration: Integration,
    document_type: &str,
    document_id: &str,
) -> Result<Option<Document>> {
    let row = sqlx::query(
        r#"
        SELECT account, pipeline, integration_name, document_type, id, created_at, updated_at,
               title, url, freshness_indicator, token_count, exceeds_token_limit
        FROM document
        WHERE account = $1 AND pipeline = $2 AND integration_name = $3
          AND document_type = $4 AND id = $5
        "#,
    )
    .bind(account_id)
    .bind(pipeline_id)
    .bind(integration.as_str())
    .bind(document_type)
    .bind(document_id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(document_from_row).transpose()
}

/// Drift detection: mirrors for the scope whose id did not appear in the
/// latest full listing.
pub async fn get_missing_documents<'e, E: PgExecutor<'e>>(
    executor: E,
    account_id: &str,
    pipeline_id: &str,
    integration: Integration,
    found_ids: &[String],
) -> Result<Vec<Document>> {
    let rows = sqlx::query(
        r#"
        SELECT account, pipeline, integration_name, document_type, id, created_at, updated_at,
               title, url, freshness_indicator, token_count, exceeds_token_limit
        FROM document
        WHERE account = $1 AND pipeline = $2 AND integration_name = $3
          AND NOT (id = ANY($4))
        "#,
    )
    .bind(account_id)
    .bind(pipeline_id)
    .bind(integration.as_str())
    .bind(found_ids)
    .fetch_all(executor)
    .await?;

    rows.iter().map(document_from_row).collect()
}

pub async fn upsert_document<'e, E: PgExecutor<'e>>(
    executor: E,
    document: &Document,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO document (account, pipeline, integration_name, document_type, id,
                              created_at, updated_at, title, url, freshness_indicator,
                              token_count, exceeds_token_limit)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ON CONFLICT (account, pipeline, integration_name, document_type, id) DO UPDATE
        SET created_at = EXCLUDED.created_at,
            updated_at = EXCLUDED.updated_at,
            title = EXCLUDED.title,
            url = EXCLUDED.url,
            freshness_indicator = EXCLUDED.freshness_indicator,
            token_count = EXCLUDED.token_count,
            exceeds_token_limit = EXCLUDED.exceeds_token_limit
        "#,
    )
    .bind(&document.account)
    .bind(&document.pipeline)
    .bind(document.integration.as_str())
    .bind(&document.document_type)
    .bind(&document.id)
    .bind(document.created_at)
    .bind(document.updated_at)
    .bind(&document.title)
    .bind(&document.url)
    .bind(&document.freshness_indicator)
    .bind(document.token_count)
    .bind(document.exceeds_token_limit)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn delete_document<'e, E: PgExecutor<'e>>(
    executor: E,
    account_id: &str,
    pipeline_id: &str,
    integration: Integration,
    document_type: &str,
    document_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM document
        WHERE account = $1 AND pipeline = $2 AND integration_name = $3
          AND document_type = $4 AND id = $5
        "#,
    )
    .bind(account_id)
    .bind(pipeline_id)
    .bind(integration.as_str())
    .bind(document_type)
    .bind(document_id)
    .execute(executor)
    .await?;
    Ok(())
}

// ============ Trait wiring ============

#[async_trait]
impl Store for PgStore {
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        get_account(&self.pool, account_id).await
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>> {
        get_pipeline(&self.pool, pipeline_id).await
    }

    async fn get_pipeline_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        get_pipeline_run(&self.pool, run_id).await
    }

    async fn get_pipeline_step(
        &self,
        run_id: &str,
        data_source_id: &str,
    ) -> Result<Option<PipelineRunStep>> {
        get_pipeline_step(&self.pool, run_id, data_source_id).await
    }

    async fn get_integration_connection(
        &self,
        account_id: &str,
        integration: Integration,
    ) -> Result<Option<IntegrationConnection>> {
        get_integration_connection(&self.pool, account_id, integration).await
    }

    async fn get_document(
        &self,
        account_id: &str,
        pipeline_id: &str,
        integration: Integration,
        document_type: &str,
        document_id: &str,
    ) -> Result<Option<Document>> {
        get_document(
            &self.pool,
            account_id,
            pipeline_id,
            integration,
            document_type,
            document_id,
        )
        .await
    }

    async fn get_missing_documents(
        &self,
        account_id: &str,
        pipeline_id: &str,
        integration: Integration,
        found_ids: &[String],
    ) -> Result<Vec<Document>> {
        get_missing_documents(&self.pool, account_id, pipeline_id, integration, found_ids).await
    }

    async fn update_pipeline_run_step(
        &self,
        run_id: &str,
        data_source_id: &str,
        status: StepStatus,
        error: Option<&RunError>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        update_pipeline_run_step(
            &self.pool,
            run_id,
            data_source_id,
            status,
            error,
            started_at,
            completed_at,
        )
        .await
    }

    async fn upsert_document(&self, document: &Document) -> Result<()> {
        upsert_document(&self.pool, document).await
    }

    async fn delete_document(
        &self,
        account_id: &str,
        pipeline_id: &str,
        integration: Integration,
        document_type: &str,
        document_id: &str,
    ) -> Result<()> {
        delete_document(
            &self.pool,
            account_id,
            pipeline_id,
            integration,
            document_type,
            document_id,
        )
        .await
    }

    async fn suspend_account(&self, account_id: &str) -> Result<()> {
        suspend_account(&self.pool, account_id).await
    }

    async fn increase_total_indexed_count(&self, account_id: &str, delta: i64) -> Result<()> {
        increase_total_indexed_count(&self.pool, account_id, delta).await
    }

    async fn increase_total_document_tokens(&self, account_id: &str, delta: i64) -> Result<()> {
        increase_total_document_tokens(&self.pool, account_id, delta).await
    }
}
