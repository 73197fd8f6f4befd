//! Run orchestrator: turns one queue message into step transitions and
//! reconciliation work.
//!
//! A message names a `(pipeline, run, data source)` triple. The handler
//! hydrates the surrounding context, applies gatekeeping, dispatches by the
//! run's sync mode, and converts every outcome it can into a terminal step
//! status plus a successful acknowledgement. Only failures that are worth
//! retrying (torn reads, unreachable database, undecodable messages)
//! propagate back to the consumer for redelivery.
//!
//! Step state machine:
//!
//! ```text
//!  pending ──(accept)──► running ──(ok)──► completed
//!     │                      │
//!     │                      └──(err)──► failed
//!     └──(gated/stale)──► completed
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::helper::{is_flagged_content, DocumentHelper};
use crate::models::{
    total_indexed_documents_limit, RunError, RunTrigger, StepStatus, SyncMode,
};
use crate::queue::{MessageHandler, QueueMessage};
use crate::sources::SourceRegistry;
use crate::store::Store;

/// Body of an index job message.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexMessage {
    #[serde(default)]
    pub kind: String,
    #[serde(rename = "accountId")]
    pub account_id: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub payload: IndexMessagePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexMessagePayload {
    #[serde(rename = "pipelineId")]
    pub pipeline_id: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "dataSourceId")]
    pub data_source_id: String,
}

/// Handler for index job messages.
pub struct IndexHandler {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) sources: SourceRegistry,
    pub(crate) helper: Arc<dyn DocumentHelper>,
    pub(crate) openai_api_key: String,
}

impl IndexHandler {
    pub fn new(
        store: Arc<dyn Store>,
        sources: SourceRegistry,
        helper: Arc<dyn DocumentHelper>,
        openai_api_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sources,
            helper,
            openai_api_key: openai_api_key.into(),
        }
    }

    /// Suspend the account when the error chain carries a `flagged_content`
    /// helper rejection.
    async fn suspend_if_flagged(&self, account_id: &str, err: &anyhow::Error) -> Result<()> {
        if is_flagged_content(err) {
            tracing::warn!(
                account_id,
                "helper flagged document content, suspending account"
            );
            self.store
                .suspend_account(account_id)
                .await
                .context("unable to suspend account")?;
        }
        Ok(())
    }

    async fn process(&self, message: IndexMessage, cancel: &CancellationToken) -> Result<()> {
        let payload = &message.payload;

        let step = self
            .store
            .get_pipeline_step(&payload.run_id, &payload.data_source_id)
            .await
            .context("unable to get pipeline run step")?;
        let pipeline = self
            .store
            .get_pipeline(&payload.pipeline_id)
            .await
            .context("unable to get pipeline")?;
        let run = self
            .store
            .get_pipeline_run(&payload.run_id)
            .await
            .context("unable to get pipeline run")?;

        // A vanished step means the job is stale; retrying cannot help.
        let Some(step) = step else {
            tracing::info!(
                run_id = %payload.run_id,
                data_source_id = %payload.data_source_id,
                "pipeline run step not found, skipping"
            );
            return Ok(());
        };

        let Some(pipeline) = pipeline else {
            bail!("pipeline {:?} not found", payload.pipeline_id);
        };
        let Some(run) = run else {
            bail!("pipeline run {:?} not found", payload.run_id);
        };

        let Some(data_source) = pipeline.config.data_source(&step.data_source).cloned() else {
            // The step references a source the pipeline config no longer
            // declares. Redelivery would hit the same tear.
            tracing::error!(
                pipeline_id = %pipeline.id,
                data_source_id = %step.data_source,
                "data source not found in pipeline config, dropping message"
            );
            return Ok(());
        };

        let account = self
            .store
            .get_account(&pipeline.account)
            .await
            .context("unable to get account")?;
        let Some(account) = account else {
            bail!("account {:?} not found", pipeline.account);
        };

        let connection = self
            .store
            .get_integration_connection(&account.id, data_source.integration())
            .await
            .context("unable to get integration connection")?;
        let Some(connection) = connection else {
            tracing::info!(
                account_id = %account.id,
                integration = %data_source.integration(),
                "integration not connected, nothing to do"
            );
            return Ok(());
        };

        let started_at = Utc::now();

        if !data_source.is_enabled() || account.is_suspended {
            tracing::info!(
                data_source_id = %data_source.id(),
                is_suspended = account.is_suspended,
                "data source gated, completing step without work"
            );
            self.store
                .update_pipeline_run_step(
                    &step.pipeline_run,
                    &step.data_source,
                    StepStatus::Completed,
                    None,
                    Some(started_at),
                    Some(started_at),
                )
                .await
                .context("unable to update pipeline run step")?;
            return Ok(());
        }

        // Committed on its own connection before the sync work starts, so
        // observers see the step running immediately.
        self.store
            .update_pipeline_run_step(
                &step.pipeline_run,
                &step.data_source,
                StepStatus::Running,
                None,
                Some(started_at),
                None,
            )
            .await
            .context("unable to update pipeline run step")?;

        match run.sync_mode {
            SyncMode::FullIndex => {
                tracing::info!(pipeline_id = %pipeline.id, "running full index");

                if let Err(err) = self
                    .run_full_index(
                        &pipeline,
                        &data_source,
                        &connection,
                        &step,
                        &account,
                        started_at,
                        cancel,
                    )
                    .await
                {
                    tracing::warn!(error = %format!("{:#}", err), "unable to run full index");
                    self.suspend_if_flagged(&account.id, &err).await?;

                    self.store
                        .update_pipeline_run_step(
                            &step.pipeline_run,
                            &step.data_source,
                            StepStatus::Failed,
                            Some(&RunError::new("index_failed", "Unable to run full index")),
                            Some(started_at),
                            Some(Utc::now()),
                        )
                        .await
                        .context("unable to update pipeline run step")?;
                }
            }
            SyncMode::SingleDocument => {
                if !account.is_unlimited {
                    let limit = total_indexed_documents_limit(account.is_subscriber);
                    if account.total_indexed_document_count + 1 >= limit {
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
                    self.store
                        .increase_total_indexed_count(&account.id, 1)
                        .await
                        .context("unable to update quotas")?;
                }

                if run.trigger == RunTrigger::IntegrationChangeEvent {
                    let Some(event) = run.integration_change_event.as_ref() else {
                        bail!("change-event run {:?} has no event payload", run.id);
                    };

                    if let Err(err) = self
                        .apply_document_change(
                            &pipeline,
                            &data_source,
                            &connection,
                            &event.change,
                            &account,
                            cancel,
                        )
                        .await
                    {
                        tracing::warn!(error = %format!("{:#}", err), "unable to handle document change");
                        self.suspend_if_flagged(&account.id, &err).await?;

                        self.store
                            .update_pipeline_run_step(
                                &step.pipeline_run,
                                &step.data_source,
                                StepStatus::Failed,
                                Some(&RunError::new(
                                    "single_document_sync_failed",
                                    "Unable to sync single document",
                                )),
                                Some(started_at),
                                Some(Utc::now()),
                            )
                            .await
                            .context("unable to update pipeline run step")?;
                        return Ok(());
                    }
                }

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
            }
        }

        Ok(())
    }
}

#[async_trait]
impl MessageHandler for IndexHandler {
    async fn handle(&self, message: &QueueMessage, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(message_id = %message.message_id, "processing index message");

        let decoded: IndexMessage =
            serde_json::from_str(&message.body).context("unable to decode message")?;

        self.process(decoded, cancel)
            .await
            .context("unable to process index message")
    }
}
