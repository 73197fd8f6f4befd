//! Core data model shared by the persistence gateway, the source clients,
//! and the reconciliation engine.
//!
//! The flow through these types mirrors the sync pipeline:
//!
//! ```text
//! queue job → PipelineRun/PipelineRunStep → DataSource → SourceClient
//!                                                            │
//!                                              IndexedDocument (listing)
//!                                                            │
//!                                       retrieve + ingest → Document (mirror)
//! ```
//!
//! # Tagged variants
//!
//! Pipeline configuration is polymorphic: data sources, text splitters,
//! embedding configs, data sinks, and vector stores each carry a
//! discriminator field that selects the payload shape. They are modeled as
//! enums with serde internal tagging, so decoding and encoding are driven by
//! the discriminator and are total over the declared variants — an unknown
//! discriminator is a (permanent) decode error, and an encoder for an
//! undeclared variant cannot be written at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============ Quotas ============

/// Lifetime cap on indexed documents per account.
pub fn total_indexed_documents_limit(is_subscriber: bool) -> i64 {
    if is_subscriber {
        1000
    } else {
        100
    }
}

/// Per-document token cap; larger documents are mirrored but never ingested.
pub fn document_token_limit(is_subscriber: bool) -> i64 {
    if is_subscriber {
        100_000
    } else {
        1000
    }
}

// ============ Integrations ============

/// Upstream integrations the worker can sync from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Integration {
    Notion,
    Linear,
}

impl Integration {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notion => "notion",
            Self::Linear => "linear",
        }
    }
}

impl std::fmt::Display for Integration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Integration {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notion" => Ok(Self::Notion),
            "linear" => Ok(Self::Linear),
            other => Err(anyhow::anyhow!("unknown integration: {:?}", other)),
        }
    }
}

/// A stored connection between an account and an integration, carrying the
/// integration-specific credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "integration_name", rename_all = "snake_case")]
pub enum IntegrationConnection {
    Notion {
        account: String,
        connected_at: String,
        config: NotionConnectionConfig,
    },
    Linear {
        account: String,
        connected_at: String,
        config: LinearConnectionConfig,
    },
}

impl IntegrationConnection {
    pub fn integration(&self) -> Integration {
        match self {
            Self::Notion { .. } => Integration::Notion,
            Self::Linear { .. } => Integration::Linear,
        }
    }
}

/// OAuth credentials and workspace metadata for a knowledge-base connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotionConnectionConfig {
    pub access_token: String,
    #[serde(default)]
    pub bot_id: String,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub workspace_name: String,
    #[serde(default)]
    pub workspace_icon: String,
}

/// OAuth credentials for an issue-tracker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearConnectionConfig {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
}

// ============ Pipeline configuration ============

/// A pipeline: one account's route from data sources to data sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub account: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub config: PipelineConfig,
    pub is_enabled: bool,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub data_sources: Vec<DataSource>,
    pub embeddings: EmbeddingConfig,
    pub data_sinks: Vec<DataSink>,
}

impl PipelineConfig {
    /// Look up a data source by id.
    pub fn data_source(&self, id: &str) -> Option<&DataSource> {
        self.data_sources.iter().find(|source| source.id() == id)
    }
}

/// A configured upstream source within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "integration_name", rename_all = "snake_case")]
pub enum DataSource {
    Notion {
        id: String,
        is_enabled: bool,
        text_splitter: TextSplitter,
    },
    Linear {
        id: String,
        is_enabled: bool,
        text_splitter: TextSplitter,
    },
}

impl DataSource {
    pub fn id(&self) -> &str {
        match self {
            Self::Notion { id, .. } | Self::Linear { id, .. } => id,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Notion { is_enabled, .. } | Self::Linear { is_enabled, .. } => *is_enabled,
        }
    }

    pub fn text_splitter(&self) -> &TextSplitter {
        match self {
            Self::Notion { text_splitter, .. } | Self::Linear { text_splitter, .. } => {
                text_splitter
            }
        }
    }

    pub fn integration(&self) -> Integration {
        match self {
            Self::Notion { .. } => Integration::Notion,
            Self::Linear { .. } => Integration::Linear,
        }
    }
}

/// Chunking strategy forwarded verbatim to the helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextSplitter {
    Character,
    RecursiveCharacter { config: RecursiveCharacterConfig },
    Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecursiveCharacterConfig {
    pub chunk_size: i64,
    pub chunk_overlap: i64,
    pub separators: Vec<String>,
}

/// Embedding provider configuration forwarded verbatim to the helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmbeddingConfig {
    Openai { config: OpenAiEmbeddingConfig },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiEmbeddingConfig {
    #[serde(default)]
    pub api_key: String,
}

/// A downstream destination within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSink {
    VectorStore {
        id: String,
        is_enabled: bool,
        config: VectorStore,
    },
}

/// Vector store selection. The per-store configuration payload is opaque to
/// the worker; the helper interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "store_type", rename_all = "snake_case")]
pub enum VectorStore {
    Pinecone { config: serde_json::Value },
    Weaviate { config: serde_json::Value },
    Qdrant { config: serde_json::Value },
    Milvus { config: serde_json::Value },
}

// ============ Runs & steps ============

/// What caused a pipeline run to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    System,
    IntegrationChangeEvent,
}

/// How a run synchronizes: a full reconciliation of the upstream listing,
/// or a single-document delta driven by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    FullIndex,
    SingleDocument,
}

/// What happened to a single upstream document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

/// A single-document change reported by an integration webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChange {
    pub action: ChangeAction,
    #[serde(rename = "documentId")]
    pub document_id: String,
    #[serde(rename = "documentType")]
    pub document_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationChangeEvent {
    pub integration: Integration,
    pub change: DocumentChange,
}

/// A scheduled execution of a pipeline. Created by the upstream scheduler;
/// the worker only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline: String,
    pub trigger: RunTrigger,
    pub sync_mode: SyncMode,
    pub integration_change_event: Option<IntegrationChangeEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Step status. Progresses `pending → running → (completed | failed)`;
/// terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::str::FromStr for StepStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown step status: {:?}", other)),
        }
    }
}

/// Machine-readable failure recorded on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

impl RunError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Per-data-source unit of work within a run, keyed by
/// `(pipeline_run, data_source)`. The worker transitions its status and
/// stamps the transition timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunStep {
    pub pipeline: String,
    pub pipeline_run: String,
    pub data_source: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<RunError>,
    pub status: StepStatus,
}

// ============ Documents ============

/// An upstream document as seen in a listing or detail call — the projection
/// the reconciler diffs against the persisted mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedDocument {
    pub integration: Integration,
    pub document_type: String,
    pub id: String,
    pub title: String,
    pub url: String,
    /// Provider-supplied last-modification marker, compared by equality only.
    pub freshness_indicator: String,
}

/// The persisted mirror of one upstream document, keyed by
/// `(account, pipeline, integration, document_type, id)`.
#[derive(Debug, Clone)]
pub struct Document {
    pub account: String,
    pub pipeline: String,
    pub integration: Integration,
    pub document_type: String,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub title: String,
    pub url: String,
    pub freshness_indicator: Option<String>,
    pub token_count: i64,
    pub exceeds_token_limit: bool,
}

// ============ Accounts ============

/// An account row. The worker reads gating flags and quota counters, and
/// writes only suspensions and additive counter updates.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub name: String,
    pub is_suspended: bool,
    pub agree_to_terms: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
    pub is_subscriber: bool,
    pub is_unlimited: bool,
    pub total_indexed_document_count: i64,
    pub total_indexed_document_tokens: i64,
}
