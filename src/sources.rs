//! Upstream source capability trait and per-integration registry.
//!
//! Each integration exposes the same three operations to the reconciler:
//! an exhaustive listing, a single-document projection, and a full-content
//! fetch. The registry maps an [`Integration`] to its client so the
//! orchestrator can dispatch by the data source's discriminator.
//!
//! Clients own their own HTTP client, retry budget, and concurrency
//! semaphore — provider rate limits are independent, so there is no global
//! cap.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::{Integration, IntegrationConnection, IndexedDocument};

/// Metadata attached to a document's text content, forwarded to the helper.
pub type DocumentMetadata = HashMap<String, serde_json::Value>;

/// Capability interface over one upstream integration.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// List every reachable document, keyed by id. Pagination is exhaustive;
    /// later pages override earlier entries for the same id.
    async fn list_documents(
        &self,
        connection: &IntegrationConnection,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, IndexedDocument>>;

    /// Fetch a single document's listing projection.
    async fn get_document(
        &self,
        document_type: &str,
        id: &str,
        connection: &IntegrationConnection,
        cancel: &CancellationToken,
    ) -> Result<IndexedDocument>;

    /// Fetch a document's full text content and metadata for ingestion.
    async fn get_document_content(
        &self,
        document_type: &str,
        id: &str,
        connection: &IntegrationConnection,
        cancel: &CancellationToken,
    ) -> Result<(String, DocumentMetadata)>;
}

/// Integration → client map used by the orchestrator.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    clients: HashMap<Integration, Arc<dyn SourceClient>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, integration: Integration, client: Arc<dyn SourceClient>) {
        self.clients.insert(integration, client);
    }

    pub fn get(&self, integration: Integration) -> Option<Arc<dyn SourceClient>> {
        self.clients.get(&integration).cloned()
    }
}
