//! Persistence gateway for the worker.
//!
//! The [`Store`] trait defines every read and write the orchestrator and
//! reconciler need, enabling pluggable backends: PostgreSQL in production
//! ([`postgres::PgStore`]) and an in-memory implementation for tests
//! ([`memory::MemoryStore`]).
//!
//! # Conventions
//!
//! - "Not found" is `Ok(None)`, never an error. Callers decide whether an
//!   absent row is a gating condition or a failure.
//! - Counter updates are **additive**: implementations must express them as
//!   a single increment, never read-modify-write, so concurrent workers
//!   cannot lose counts. Duplicate delivery may over-count; that is the
//!   accepted trade for at-least-once processing.
//! - Every write is idempotent under replay: step updates and suspensions
//!   overwrite, document upserts conflict on the document key.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`get_account`](Store::get_account) | Quota flags and counters |
//! | [`get_pipeline`](Store::get_pipeline) | Pipeline config (sources, embeddings, sinks) |
//! | [`get_pipeline_run`](Store::get_pipeline_run) | Trigger, sync mode, change event |
//! | [`get_pipeline_step`](Store::get_pipeline_step) | Step keyed by `(run, data source)` |
//! | [`get_integration_connection`](Store::get_integration_connection) | Credentials for one integration |
//! | [`get_document`](Store::get_document) | One mirror row |
//! | [`get_missing_documents`](Store::get_missing_documents) | Drift: mirrors absent from the latest listing |
//! | [`update_pipeline_run_step`](Store::update_pipeline_run_step) | Status transition + timestamps |
//! | [`upsert_document`](Store::upsert_document) | Insert/overwrite one mirror row |
//! | [`delete_document`](Store::delete_document) | Drop one mirror row |
//! | [`suspend_account`](Store::suspend_account) | Flag an account after flagged content |
//! | [`increase_total_indexed_count`](Store::increase_total_indexed_count) | Additive quota counter |
//! | [`increase_total_document_tokens`](Store::increase_total_document_tokens) | Additive token counter |

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Account, Document, Integration, IntegrationConnection, Pipeline, PipelineRun,
    PipelineRunStep, RunError, StepStatus,
};

/// Abstract persistence backend.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>>;

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>>;

    async fn get_pipeline_run(&self, run_id: &str) -> Result<Option<PipelineRun>>;

    async fn get_pipeline_step(
        &self,
        run_id: &str,
        data_source_id: &str,
    ) -> Result<Option<PipelineRunStep>>;

    async fn get_integration_connection(
        &self,
        account_id: &str,
        integration: Integration,
    ) -> Result<Option<IntegrationConnection>>;

    async fn get_document(
        &self,
        account_id: &str,
        pipeline_id: &str,
        integration: Integration,
        document_type: &str,
        document_id: &str,
    ) -> Result<Option<Document>>;

    /// Every mirror row for `(account, pipeline, integration)` whose id is
    /// **not** in `found_ids` — the drift-detection query.
    async fn get_missing_documents(
        &self,
        account_id: &str,
        pipeline_id: &str,
        integration: Integration,
        found_ids: &[String],
    ) -> Result<Vec<Document>>;

    /// Overwrite a step's status, error, and transition timestamps.
    async fn update_pipeline_run_step(
        &self,
        run_id: &str,
        data_source_id: &str,
        status: StepStatus,
        error: Option<&RunError>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Insert a mirror row, overwriting all mutable fields on conflict with
    /// the `(account, pipeline, integration, document_type, id)` key.
    async fn upsert_document(&self, document: &Document) -> Result<()>;

    async fn delete_document(
        &self,
        account_id: &str,
        pipeline_id: &str,
        integration: Integration,
        document_type: &str,
        document_id: &str,
    ) -> Result<()>;

    async fn suspend_account(&self, account_id: &str) -> Result<()>;

    async fn increase_total_indexed_count(&self, account_id: &str, delta: i64) -> Result<()>;

    async fn increase_total_document_tokens(&self, account_id: &str, delta: i64) -> Result<()>;
}
