//! End-to-end sync scenarios against the in-memory store.
//!
//! These tests drive the orchestrator through the same `MessageHandler`
//! entry point the queue consumer uses, with scripted source and helper
//! fakes standing in for the upstream integrations. The final wiremock
//! scenario swaps in the real helper client to exercise the HTTP retry
//! path end to end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use docsync::handler::IndexHandler;
use docsync::helper::{DocumentHelper, HelperClient, HelperError, HelperErrorCode};
use docsync::models::{
    Account, ChangeAction, DataSink, DataSource, Document, DocumentChange, EmbeddingConfig,
    IndexedDocument, Integration, IntegrationChangeEvent, IntegrationConnection,
    OpenAiEmbeddingConfig, Pipeline, PipelineConfig, PipelineRun, PipelineRunStep,
    RecursiveCharacterConfig, RunTrigger, StepStatus, SyncMode, TextSplitter, VectorStore,
};
use docsync::queue::{MessageHandler, QueueMessage};
use docsync::sources::{DocumentMetadata, SourceClient, SourceRegistry};
use docsync::store::memory::MemoryStore;

// ============ Fakes ============

#[derive(Default)]
struct FakeSource {
    listing: HashMap<String, IndexedDocument>,
    contents: HashMap<String, String>,
    list_calls: AtomicUsize,
    content_calls: Mutex<Vec<String>>,
}

impl FakeSource {
    fn with_documents(documents: Vec<IndexedDocument>) -> Self {
        Self {
            listing: documents.into_iter().map(|doc| (doc.id.clone(), doc)).collect(),
            ..Self::default()
        }
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn content_calls(&self) -> Vec<String> {
        let mut calls = self.content_calls.lock().unwrap().clone();
        calls.sort();
        calls
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn list_documents(
        &self,
        _connection: &IntegrationConnection,
        _cancel: &CancellationToken,
    ) -> Result<HashMap<String, IndexedDocument>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.listing.clone())
    }

    async fn get_document(
        &self,
        _document_type: &str,
        id: &str,
        _connection: &IntegrationConnection,
        _cancel: &CancellationToken,
    ) -> Result<IndexedDocument> {
        self.listing
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown document {:?}", id))
    }

    async fn get_document_content(
        &self,
        _document_type: &str,
        id: &str,
        _connection: &IntegrationConnection,
        _cancel: &CancellationToken,
    ) -> Result<(String, DocumentMetadata)> {
        self.content_calls.lock().unwrap().push(id.to_string());
        let text = self
            .contents
            .get(id)
            .cloned()
            .unwrap_or_else(|| format!("body of {}", id));
        Ok((text, DocumentMetadata::new()))
    }
}

#[derive(Default)]
struct FakeHelper {
    token_counts: HashMap<String, i64>,
    flagged_documents: HashSet<String>,
    ingested: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeHelper {
    fn ingested(&self) -> Vec<String> {
        let mut ids = self.ingested.lock().unwrap().clone();
        ids.sort();
        ids
    }

    fn deleted(&self) -> Vec<String> {
        let mut ids = self.deleted.lock().unwrap().clone();
        ids.sort();
        ids
    }
}

#[async_trait]
impl DocumentHelper for FakeHelper {
    async fn count_document_tokens(&self, text: &str, _cancel: &CancellationToken) -> Result<i64> {
        Ok(self.token_counts.get(text).copied().unwrap_or(10))
    }

    async fn ingest_document(
        &self,
        _splitter: &TextSplitter,
        _embeddings: &EmbeddingConfig,
        _sinks: &[DataSink],
        _openai_api_key: &str,
        document: &IndexedDocument,
        _text: &str,
        _metadata: &DocumentMetadata,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        if self.flagged_documents.contains(&document.id) {
            return Err(anyhow::Error::new(HelperError {
                code: HelperErrorCode::FlaggedContent,
                message: "document rejected by moderation".into(),
                is_transient: false,
            })
            .context("unable to ingest document"));
        }
        self.ingested.lock().unwrap().push(document.id.clone());
        Ok(())
    }

    async fn delete_document(
        &self,
        _sinks: &[DataSink],
        _integration: Integration,
        _document_type: &str,
        document_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.deleted.lock().unwrap().push(document_id.to_string());
        Ok(())
    }
}

// ============ Fixtures ============

fn account(id: &str) -> Account {
    Account {
        id: id.to_string(),
        email: format!("{}@example.test", id),
        name: "Test Account".into(),
        is_suspended: false,
        agree_to_terms: true,
        created_at: Utc::now(),
        last_login_at: Utc::now(),
        is_subscriber: false,
        is_unlimited: false,
        total_indexed_document_count: 0,
        total_indexed_document_tokens: 0,
    }
}

fn pipeline(id: &str, account_id: &str, data_source_id: &str, enabled: bool) -> Pipeline {
    Pipeline {
        id: id.to_string(),
        account: account_id.to_string(),
        name: "Sync pipeline".into(),
        created_at: Utc::now(),
        updated_at: None,
        config: PipelineConfig {
            data_sources: vec![DataSource::Linear {
                id: data_source_id.to_string(),
                is_enabled: enabled,
                text_splitter: TextSplitter::RecursiveCharacter {
                    config: RecursiveCharacterConfig {
                        chunk_size: 1000,
                        chunk_overlap: 100,
                        separators: vec!["\n\n".into(), "\n".into()],
                    },
                },
            }],
            embeddings: EmbeddingConfig::Openai {
                config: OpenAiEmbeddingConfig { api_key: String::new() },
            },
            data_sinks: vec![DataSink::VectorStore {
                id: "sink-1".into(),
                is_enabled: true,
                config: VectorStore::Qdrant {
                    config: serde_json::json!({ "collection": "docs" }),
                },
            }],
        },
        is_enabled: true,
        is_default: true,
    }
}

fn full_index_run(id: &str, pipeline_id: &str) -> PipelineRun {
    PipelineRun {
        id: id.to_string(),
        pipeline: pipeline_id.to_string(),
        trigger: RunTrigger::Manual,
        sync_mode: SyncMode::FullIndex,
        integration_change_event: None,
        created_at: Utc::now(),
        updated_at: None,
    }
}

fn change_run(id: &str, pipeline_id: &str, action: ChangeAction, document_id: &str) -> PipelineRun {
    PipelineRun {
        id: id.to_string(),
        pipeline: pipeline_id.to_string(),
        trigger: RunTrigger::IntegrationChangeEvent,
        sync_mode: SyncMode::SingleDocument,
        integration_change_event: Some(IntegrationChangeEvent {
            integration: Integration::Linear,
            change: DocumentChange {
                action,
                document_id: document_id.to_string(),
                document_type: "issue".into(),
            },
        }),
        created_at: Utc::now(),
        updated_at: None,
    }
}

fn pending_step(run_id: &str, pipeline_id: &str, data_source_id: &str) -> PipelineRunStep {
    PipelineRunStep {
        pipeline: pipeline_id.to_string(),
        pipeline_run: run_id.to_string(),
        data_source: data_source_id.to_string(),
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        error: None,
        status: StepStatus::Pending,
    }
}

fn linear_connection(account_id: &str) -> IntegrationConnection {
    serde_json::from_value(serde_json::json!({
        "integration_name": "linear",
        "account": account_id,
        "connected_at": "2024-01-01T00:00:00Z",
        "config": { "access_token": "secret", "token_type": "Bearer" }
    }))
    .unwrap()
}

fn issue(id: &str, freshness: &str) -> IndexedDocument {
    IndexedDocument {
        integration: Integration::Linear,
        document_type: "issue".into(),
        id: id.to_string(),
        title: format!("Issue {}", id),
        url: format!("https://tracker.test/{}", id),
        freshness_indicator: freshness.to_string(),
    }
}

fn mirror(account_id: &str, pipeline_id: &str, id: &str, freshness: &str) -> Document {
    Document {
        account: account_id.to_string(),
        pipeline: pipeline_id.to_string(),
        integration: Integration::Linear,
        document_type: "issue".into(),
        id: id.to_string(),
        created_at: Utc::now(),
        updated_at: Some(Utc::now()),
        title: format!("Issue {}", id),
        url: format!("https://tracker.test/{}", id),
        freshness_indicator: Some(freshness.to_string()),
        token_count: 10,
        exceeds_token_limit: false,
    }
}

fn index_message(pipeline_id: &str, run_id: &str, data_source_id: &str) -> QueueMessage {
    QueueMessage {
        message_id: "mid-1".into(),
        receipt_handle: "receipt-1".into(),
        body: serde_json::json!({
            "kind": "index",
            "accountId": "acct-1",
            "messageId": "mid-1",
            "payload": {
                "pipelineId": pipeline_id,
                "runId": run_id,
                "dataSourceId": data_source_id,
            }
        })
        .to_string(),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    source: Arc<FakeSource>,
    helper: Arc<FakeHelper>,
    handler: IndexHandler,
}

fn harness(source: FakeSource, helper: FakeHelper) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(source);
    let helper = Arc::new(helper);

    let mut sources = SourceRegistry::new();
    sources.register(Integration::Linear, source.clone());

    let handler = IndexHandler::new(store.clone(), sources, helper.clone(), "sk-test");
    Harness {
        store,
        source,
        helper,
        handler,
    }
}

async fn run(harness: &Harness, message: &QueueMessage) -> Result<()> {
    harness
        .handler
        .handle(message, &CancellationToken::new())
        .await
}

// ============ Scenarios ============

#[tokio::test]
async fn stale_step_is_swallowed() {
    let h = harness(FakeSource::default(), FakeHelper::default());
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    // No step row: the job is stale.

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    assert_eq!(h.source.list_calls(), 0);
    assert_eq!(h.store.document_count(), 0);
}

#[tokio::test]
async fn disabled_data_source_completes_without_work() {
    let h = harness(FakeSource::default(), FakeHelper::default());
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", false));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    let step = h.store.step("run-1", "ds-1").unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert!(step.started_at.is_some());
    assert_eq!(step.started_at, step.completed_at);
    assert_eq!(h.source.list_calls(), 0);
}

#[tokio::test]
async fn suspended_account_completes_without_work() {
    let h = harness(FakeSource::default(), FakeHelper::default());
    let mut suspended = account("acct-1");
    suspended.is_suspended = true;
    h.store.insert_account(suspended);
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    let step = h.store.step("run-1", "ds-1").unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(h.source.list_calls(), 0);
}

#[tokio::test]
async fn missing_connection_is_a_noop() {
    let h = harness(FakeSource::default(), FakeHelper::default());
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    // No connection seeded.

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    let step = h.store.step("run-1", "ds-1").unwrap();
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(h.source.list_calls(), 0);
}

#[tokio::test]
async fn unknown_data_source_is_dropped_without_redelivery() {
    let h = harness(FakeSource::default(), FakeHelper::default());
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-gone"));

    // Ok means the message is acknowledged, not redelivered
    run(&h, &index_message("pipe-1", "run-1", "ds-gone")).await.unwrap();

    let step = h.store.step("run-1", "ds-gone").unwrap();
    assert_eq!(step.status, StepStatus::Pending);
}

#[tokio::test]
async fn malformed_message_requests_redelivery() {
    let h = harness(FakeSource::default(), FakeHelper::default());
    let message = QueueMessage {
        message_id: "mid-1".into(),
        receipt_handle: "receipt-1".into(),
        body: "not json".into(),
    };

    let err = run(&h, &message).await.unwrap_err();
    assert!(err.to_string().contains("unable to decode message"));
}

#[tokio::test]
async fn quota_exhaustion_in_single_document_mode_fails_fast() {
    let h = harness(FakeSource::default(), FakeHelper::default());
    let mut capped = account("acct-1");
    capped.total_indexed_document_count = 100;
    h.store.insert_account(capped);
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(change_run("run-1", "pipe-1", ChangeAction::Create, "i1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    let step = h.store.step("run-1", "ds-1").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.error.as_ref().unwrap().code, "limit_exceeded");
    assert!(step.completed_at.is_some());
    assert!(h.helper.ingested().is_empty());
    assert_eq!(
        h.store.account("acct-1").unwrap().total_indexed_document_count,
        100
    );
}

#[tokio::test]
async fn quota_exhaustion_in_full_index_stops_early() {
    let source = FakeSource::with_documents(vec![issue("i1", "f1"), issue("i2", "f2")]);
    let h = harness(source, FakeHelper::default());
    let mut capped = account("acct-1");
    capped.total_indexed_document_count = 100;
    h.store.insert_account(capped);
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    let step = h.store.step("run-1", "ds-1").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.error.as_ref().unwrap().code, "limit_exceeded");
    assert!(h.helper.ingested().is_empty());
    assert_eq!(h.store.document_count(), 0);
}

#[tokio::test]
async fn full_index_truncates_to_remaining_allowance() {
    let source = FakeSource::with_documents(vec![
        issue("a", "f1"),
        issue("b", "f2"),
        issue("c", "f3"),
    ]);
    let h = harness(source, FakeHelper::default());
    let mut nearly_capped = account("acct-1");
    nearly_capped.total_indexed_document_count = 98;
    h.store.insert_account(nearly_capped);
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    // Two slots left; lexicographically smallest ids win
    assert_eq!(h.helper.ingested(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(
        h.store.document_ids("acct-1", "pipe-1", Integration::Linear),
        vec!["a".to_string(), "b".to_string()]
    );
    assert_eq!(
        h.store.account("acct-1").unwrap().total_indexed_document_count,
        100
    );
    assert_eq!(h.store.step("run-1", "ds-1").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn full_index_reconciles_drift() {
    let source = FakeSource::with_documents(vec![
        issue("a", "fresh-a"),
        issue("b", "fresh-b"),
        issue("c", "fresh-c"),
    ]);
    let h = harness(source, FakeHelper::default());
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));
    // Previously mirrored: a (stale) and x (deleted upstream)
    h.store.insert_document(mirror("acct-1", "pipe-1", "a", "stale-a"));
    h.store.insert_document(mirror("acct-1", "pipe-1", "x", "fresh-x"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    assert_eq!(
        h.helper.ingested(),
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );
    assert_eq!(h.helper.deleted(), vec!["x".to_string()]);
    assert_eq!(
        h.store.document_ids("acct-1", "pipe-1", Integration::Linear),
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    );

    let step = h.store.step("run-1", "ds-1").unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert!(step.completed_at.is_some());
}

#[tokio::test]
async fn fresh_documents_short_circuit() {
    let source = FakeSource::with_documents(vec![issue("a", "same"), issue("b", "new")]);
    let h = harness(source, FakeHelper::default());
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));
    h.store.insert_document(mirror("acct-1", "pipe-1", "a", "same"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    // Only the changed document is fetched and ingested
    assert_eq!(h.source.content_calls(), vec!["b".to_string()]);
    assert_eq!(h.helper.ingested(), vec!["b".to_string()]);
    assert_eq!(
        h.store.document_ids("acct-1", "pipe-1", Integration::Linear),
        vec!["a".to_string(), "b".to_string()]
    );
}

#[tokio::test]
async fn flagged_content_suspends_account_and_fails_step() {
    let source = FakeSource::with_documents(vec![issue("bad", "f1")]);
    let helper = FakeHelper {
        flagged_documents: HashSet::from(["bad".to_string()]),
        ..FakeHelper::default()
    };
    let h = harness(source, helper);
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));

    // Ok: the failure is terminal, the message must be acknowledged
    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    assert!(h.store.account("acct-1").unwrap().is_suspended);
    let step = h.store.step("run-1", "ds-1").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.error.as_ref().unwrap().code, "index_failed");
    assert!(step.completed_at.is_some());
}

#[tokio::test]
async fn oversized_document_mirrors_without_ingest() {
    let mut source = FakeSource::with_documents(vec![issue("huge", "f1")]);
    source
        .contents
        .insert("huge".to_string(), "very long text".to_string());
    let helper = FakeHelper {
        token_counts: HashMap::from([("very long text".to_string(), 5000_i64)]),
        ..FakeHelper::default()
    };
    let h = harness(source, helper);
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    // Non-subscriber token limit is 1000: mirrored, never ingested
    assert!(h.helper.ingested().is_empty());
    assert_eq!(h.store.step("run-1", "ds-1").unwrap().status, StepStatus::Completed);
    assert_eq!(h.store.account("acct-1").unwrap().total_indexed_document_tokens, 0);
    assert_eq!(
        h.store.document_ids("acct-1", "pipe-1", Integration::Linear),
        vec!["huge".to_string()]
    );
}

#[tokio::test]
async fn single_document_create_ingests_and_counts() {
    let source = FakeSource::with_documents(vec![issue("i1", "f1")]);
    let h = harness(source, FakeHelper::default());
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(change_run("run-1", "pipe-1", ChangeAction::Create, "i1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    assert_eq!(h.helper.ingested(), vec!["i1".to_string()]);
    let refreshed = h.store.account("acct-1").unwrap();
    assert_eq!(refreshed.total_indexed_document_count, 1);
    assert_eq!(refreshed.total_indexed_document_tokens, 10);
    assert_eq!(h.store.step("run-1", "ds-1").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn single_document_delete_removes_mirror_and_sinks() {
    let h = harness(FakeSource::default(), FakeHelper::default());
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(change_run("run-1", "pipe-1", ChangeAction::Delete, "i1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));
    h.store.insert_document(mirror("acct-1", "pipe-1", "i1", "f1"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    assert_eq!(h.helper.deleted(), vec!["i1".to_string()]);
    assert!(h
        .store
        .document_ids("acct-1", "pipe-1", Integration::Linear)
        .is_empty());
    assert_eq!(h.store.step("run-1", "ds-1").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn non_change_event_trigger_completes_without_work() {
    let h = harness(FakeSource::default(), FakeHelper::default());
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    let mut manual = change_run("run-1", "pipe-1", ChangeAction::Create, "i1");
    manual.trigger = RunTrigger::Manual;
    manual.integration_change_event = None;
    h.store.insert_run(manual);
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));

    run(&h, &index_message("pipe-1", "run-1", "ds-1")).await.unwrap();

    assert!(h.helper.ingested().is_empty());
    assert_eq!(h.source.list_calls(), 0);
    assert_eq!(h.store.step("run-1", "ds-1").unwrap().status, StepStatus::Completed);
    // The quota reservation still happens before the trigger check
    assert_eq!(
        h.store.account("acct-1").unwrap().total_indexed_document_count,
        1
    );
}

#[tokio::test]
async fn replaying_a_full_index_is_idempotent_on_state() {
    let source = FakeSource::with_documents(vec![issue("a", "f-a"), issue("b", "f-b")]);
    let h = harness(source, FakeHelper::default());
    h.store.insert_account(account("acct-1"));
    h.store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    h.store.insert_run(full_index_run("run-1", "pipe-1"));
    h.store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    h.store.insert_connection(linear_connection("acct-1"));

    let message = index_message("pipe-1", "run-1", "ds-1");
    run(&h, &message).await.unwrap();
    let first_mirror = h.store.document_ids("acct-1", "pipe-1", Integration::Linear);
    let first_count = h.store.account("acct-1").unwrap().total_indexed_document_count;

    run(&h, &message).await.unwrap();
    let second_mirror = h.store.document_ids("acct-1", "pipe-1", Integration::Linear);
    let second_count = h.store.account("acct-1").unwrap().total_indexed_document_count;

    // Same terminal state and mirror set; counters never decrease (an
    // over-count on replay is the accepted at-least-once trade)
    assert_eq!(first_mirror, second_mirror);
    assert_eq!(h.store.step("run-1", "ds-1").unwrap().status, StepStatus::Completed);
    assert!(second_count >= first_count);
    // The second pass short-circuits on freshness: no duplicate ingests
    assert_eq!(h.helper.ingested(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn transient_helper_failure_recovers_end_to_end() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/count"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "token_count": 25
        })))
        .mount(&server)
        .await;
    // First ingest attempt is rate limited, the second succeeds
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(FakeSource::with_documents(vec![issue("i1", "f1")]));
    let mut sources = SourceRegistry::new();
    sources.register(Integration::Linear, source.clone());
    let helper = Arc::new(HelperClient::new(server.uri()).unwrap());
    let handler = IndexHandler::new(store.clone(), sources, helper, "sk-test");

    store.insert_account(account("acct-1"));
    store.insert_pipeline(pipeline("pipe-1", "acct-1", "ds-1", true));
    store.insert_run(full_index_run("run-1", "pipe-1"));
    store.insert_step(pending_step("run-1", "pipe-1", "ds-1"));
    store.insert_connection(linear_connection("acct-1"));

    handler
        .handle(
            &index_message("pipe-1", "run-1", "ds-1"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(store.step("run-1", "ds-1").unwrap().status, StepStatus::Completed);
    assert_eq!(
        store.document_ids("acct-1", "pipe-1", Integration::Linear),
        vec!["i1".to_string()]
    );
    let refreshed = store.account("acct-1").unwrap();
    assert_eq!(refreshed.total_indexed_document_tokens, 25);
    assert_eq!(refreshed.total_indexed_document_count, 1);
}
