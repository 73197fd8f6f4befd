//! Reconciliation engine: full-index diffs and single-document deltas.
//!
//! # Full index
//!
//! ```text
//! list upstream ──► quota truncation ──► parallel retrieve+ingest+upsert
//!                                                    │
//!                                         drift query (ids not listed)
//!                                                    │
//!                                         parallel sink+mirror deletion
//! ```
//!
//! The upstream listing is the source of truth: after a successful run, the
//! mirror set for `(account, pipeline, integration)` equals the listed ids
//! (modulo quota truncation). Per-document work fans out with
//! cancel-on-first-error semantics; a partial fan-out leaves surviving
//! mirrors in place, and the next full index reconciles them.
//!
//! # Per-document pipeline
//!
//! Fixed order: freshness short-circuit → fetch content → count tokens →
//! ingest (skipped above the token limit) → mirror upsert. The freshness
//! indicator is compared by equality only; any change re-ingests.

use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::handler::IndexHandler;
use crate::models::{
    document_token_limit, total_indexed_documents_limit, Account, DataSource, Document,
    DocumentChange, ChangeAction, Integration, IntegrationConnection, Pipeline, PipelineRunStep,
    RunError, StepStatus, IndexedDocument,
};
use crate::sources::SourceClient;

impl IndexHandler {
    /// Full reconciliation of one `(pipeline, data source)` against the
    /// upstream listing. Marks the step terminal on both the quota-exhausted
    /// and the success path; other errors bubble to the orchestrator.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_full_index(
        &self,
        pipeline: &Pipeline,
        data_source: &DataSource,
        connection: &IntegrationConnection,
        step: &PipelineRunStep,
        account: &Account,
        started_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let client = self
            .sources
            .get(connection.integration())
            .ok_or_else(|| {
                anyhow!(
                    "no source client registered for integration {}",
                    connection.integration()
                )
            })?;

        let mut indexed = client
            .list_documents(connection, cancel)
            .await
            .context("unable to list upstream documents")?;

        if !account.is_unlimited {
            let remaining = (total_indexed_documents_limit(account.is_subscriber)
                - account.total_indexed_document_count)
                .max(0) as usize;

            if remaining == 0 {
                self.store
                    .update_pipeline_run_step(
                        &step.pipeline_run,
                        &step.data_source,
                        StepStatus::Failed,
                        Some(&RunError::new(
                            "limit_exceeded",
                            "Exceeded total indexed document limit",
                        )),
                        Some(started_at),
                        Some(Utc::now()),
                    )
                    .await
                    .context("unable to update pipeline run step")?;
                return Ok(());
            }

            if indexed.len() > remaining {
                // Deterministic truncation: keep the lexicographically
                // smallest ids up to the remaining allowance.
                let mut keep: Vec<String> = indexed.keys().cloned().collect();
                keep.sort();
                keep.truncate(remaining);
                let keep: HashSet<String> = keep.into_iter().collect();
                indexed.retain(|id, _| keep.contains(id));
            }

            self.store
                .increase_total_indexed_count(&account.id, indexed.len() as i64)
                .await
                .context("unable to update quotas")?;
        }

        tracing::info!(count = indexed.len(), "ingesting documents");

        let token_limit = document_token_limit(account.is_subscriber);
        try_join_all(indexed.values().map(|document| {
            self.retrieve_ingest_upsert(
                document,
                pipeline,
                data_source,
                connection,
                client.as_ref(),
                token_limit,
                cancel,
            )
        }))
        .await
        .context("unable to upsert documents")?;

        // A full listing just succeeded, so any previously mirrored id that
        // was not listed has been deleted upstream.
        let found_ids: Vec<String> = indexed.keys().cloned().collect();
        let deleted = self
            .store
            .get_missing_documents(
                &pipeline.account,
                &pipeline.id,
                connection.integration(),
                &found_ids,
            )
            .await
            .context("unable to get deleted documents")?;

        if !deleted.is_empty() {
            tracing::info!(count = deleted.len(), "deleting drifted documents");
        }
        try_join_all(deleted.iter().map(|document| {
            self.remove_document(
                pipeline,
                document.integration,
                &document.document_type,
                &document.id,
                cancel,
            )
        }))
        .await
        .context("unable to delete documents")?;

        self.store
            .update_pipeline_run_step(
                &step.pipeline_run,
                &step.data_source,
                StepStatus::Completed,
                None,
                Some(started_at),
                Some(Utc::now()),
            )
            .await
            .context("unable to update pipeline run step")?;

        Ok(())
    }

    /// Apply one integration change event.
    pub(crate) async fn apply_document_change(
        &self,
        pipeline: &Pipeline,
        data_source: &DataSource,
        connection: &IntegrationConnection,
        change: &DocumentChange,
        account: &Account,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let client = self
            .sources
            .get(connection.integration())
            .ok_or_else(|| {
                anyhow!(
                    "no source client registered for integration {}",
                    connection.integration()
                )
            })?;

        match change.action {
            ChangeAction::Create | ChangeAction::Update => {
                let document = client
                    .get_document(&change.document_type, &change.document_id, connection, cancel)
                    .await
                    .context("unable to get document")?;

                self.retrieve_ingest_upsert(
                    &document,
                    pipeline,
                    data_source,
                    connection,
                    client.as_ref(),
                    document_token_limit(account.is_subscriber),
                    cancel,
                )
                .await
            }
            ChangeAction::Delete => {
                self.remove_document(
                    pipeline,
                    connection.integration(),
                    &change.document_type,
                    &change.document_id,
                    cancel,
                )
                .await
            }
        }
    }

    /// Per-document pipeline: fetch content, count tokens, ingest through
    /// the helper unless over the token limit, then upsert the mirror.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn retrieve_ingest_upsert(
        &self,
        document: &IndexedDocument,
        pipeline: &Pipeline,
        data_source: &DataSource,
        connection: &IntegrationConnection,
        client: &dyn SourceClient,
        token_limit: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Only re-ingest when the upstream object actually changed
        let existing = self
            .store
            .get_document(
                &pipeline.account,
                &pipeline.id,
                document.integration,
                &document.document_type,
                &document.id,
            )
            .await
            .context("unable to get existing document")?;

        if let Some(existing) = existing {
            if existing.freshness_indicator.as_deref() == Some(document.freshness_indicator.as_str())
            {
                tracing::debug!(document_id = %document.id, "document already fresh, skipping");
                return Ok(());
            }
        }

        tracing::debug!(document_id = %document.id, "retrieving text content");
        let (text, metadata) = client
            .get_document_content(&document.document_type, &document.id, connection, cancel)
            .await
            .context("unable to get document text content")?;

        let token_count = self
            .helper
            .count_document_tokens(&text, cancel)
            .await
            .context("unable to count document tokens")?;

        let exceeds_token_limit = token_count > token_limit;
        if exceeds_token_limit {
            tracing::info!(
                document_id = %document.id,
                token_count,
                token_limit,
                "token limit exceeded, skipping ingestion"
            );
        } else {
            tracing::debug!(document_id = %document.id, "ingesting document");
            self.helper
                .ingest_document(
                    data_source.text_splitter(),
                    &pipeline.config.embeddings,
                    &pipeline.config.data_sinks,
                    &self.openai_api_key,
                    document,
                    &text,
                    &metadata,
                    cancel,
                )
                .await
                .context("unable to ingest document")?;

            // Best effort; a failed counter update never fails the document
            if let Err(err) = self
                .store
                .increase_total_document_tokens(&pipeline.account, token_count)
                .await
            {
                tracing::error!(error = %err, "unable to increase total document tokens");
            }
        }

        let now = Utc::now();
        self.store
            .upsert_document(&Document {
                account: pipeline.account.clone(),
                pipeline: pipeline.id.clone(),
                integration: document.integration,
                document_type: document.document_type.clone(),
                id: document.id.clone(),
                created_at: now,
                updated_at: Some(now),
                title: document.title.clone(),
                url: document.url.clone(),
                freshness_indicator: Some(document.freshness_indicator.clone()),
                token_count,
                exceeds_token_limit,
            })
            .await
            .context("unable to upsert document")?;

        tracing::debug!(document_id = %document.id, "document mirrored");
        Ok(())
    }

    /// Delete one document from every sink, then drop its mirror row.
    pub(crate) async fn remove_document(
        &self,
        pipeline: &Pipeline,
        integration: Integration,
        document_type: &str,
        document_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.helper
            .delete_document(
                &pipeline.config.data_sinks,
                integration,
                document_type,
                document_id,
                cancel,
            )
            .await
            .context("unable to delete document from sinks")?;

        self.store
            .delete_document(
                &pipeline.account,
                &pipeline.id,
                integration,
                document_type,
                document_id,
            )
            .await
            .context("unable to delete document from database")?;

        Ok(())
    }
}
