//! Client for the embedding/vector-store helper service.
//!
//! The helper is stateless: every call carries the full splitter, embedding
//! config, and sink list, so the worker owns all pipeline state. Endpoints:
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `POST` | `/count` | Token-count a document's text |
//! | `POST` | `/ingest` | Chunk, embed, and upsert into every sink |
//! | `DELETE` | `/documents/{id}` | Remove a document from every sink |
//!
//! # Error contract
//!
//! A 400 response carries `{error: {code, message, is_transient}}`. The
//! declared `is_transient` flag decides whether the retry budget (5
//! attempts) takes another swing; 429 is always transient; any other
//! non-2xx is permanent. The decoded [`HelperError`] survives the error
//! chain so the orchestrator can react to `flagged_content` by suspending
//! the account.
//!
//! At most 5 helper calls are in flight at once, shared across all workers
//! holding the same client.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::models::{DataSink, EmbeddingConfig, IndexedDocument, Integration, TextSplitter};
use crate::retry::{retry_with_backoff, RetryError};
use crate::sources::DocumentMetadata;

/// In-flight request cap.
const MAX_IN_FLIGHT: usize = 5;
/// Retry budget per call.
const MAX_ATTEMPTS: u32 = 5;

/// Error codes the helper can declare on a 400 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperErrorCode {
    InvalidEmbeddings,
    FlaggedContent,
    InvalidVectorStore,
    InvalidTextSplitter,
    VectorStoreUpsertFailed,
    VectorStoreDeleteFailed,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for HelperErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidEmbeddings => "invalid_embeddings",
            Self::FlaggedContent => "flagged_content",
            Self::InvalidVectorStore => "invalid_vector_store",
            Self::InvalidTextSplitter => "invalid_text_splitter",
            Self::VectorStoreUpsertFailed => "vector_store_upsert_failed",
            Self::VectorStoreDeleteFailed => "vector_store_delete_failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A structured helper failure, decoded from a 400 body.
#[derive(Debug, Clone, Deserialize, thiserror::Error)]
#[error("document helper error ({code}): {message}")]
pub struct HelperError {
    pub code: HelperErrorCode,
    #[serde(default)]
    pub message: String,
    /// Whether the helper believes a retry can succeed.
    #[serde(default)]
    pub is_transient: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: HelperError,
}

/// True when the error chain bottoms out in a `flagged_content` rejection.
pub fn is_flagged_content(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<HelperError>()
            .is_some_and(|helper_err| helper_err.code == HelperErrorCode::FlaggedContent)
    })
}

/// Operations the orchestrator needs from the helper.
#[async_trait]
pub trait DocumentHelper: Send + Sync {
    async fn count_document_tokens(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<i64>;

    #[allow(clippy::too_many_arguments)]
    async fn ingest_document(
        &self,
        splitter: &TextSplitter,
        embeddings: &EmbeddingConfig,
        sinks: &[DataSink],
        openai_api_key: &str,
        document: &IndexedDocument,
        text: &str,
        metadata: &DocumentMetadata,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn delete_document(
        &self,
        sinks: &[DataSink],
        integration: Integration,
        document_type: &str,
        document_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// HTTP implementation of [`DocumentHelper`].
pub struct HelperClient {
    http: reqwest::Client,
    endpoint: String,
    semaphore: Semaphore,
}

impl HelperClient {
    /// Build a client against the helper's base URL.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            endpoint: endpoint.into(),
            semaphore: Semaphore::new(MAX_IN_FLIGHT),
        })
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<tokio::sync::SemaphorePermit<'_>> {
        tokio::select! {
            permit = self.semaphore.acquire() => Ok(permit?),
            _ = cancel.cancelled() => Err(anyhow!("cancelled while waiting for helper slot")),
        }
    }

    /// Send one request under the retry budget, classifying failures per the
    /// helper's error contract.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), path);

        retry_with_backoff(MAX_ATTEMPTS, cancel, || {
            let request = self
                .http
                .request(method.clone(), &url)
                .header("Content-Type", "application/json")
                .json(&body);

            async move {
                let response = request.send().await.map_err(|err| {
                    if err.is_timeout() {
                        RetryError::transient(err)
                    } else {
                        RetryError::permanent(err)
                    }
                })?;

                let status = response.status();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(RetryError::transient(anyhow!("too many requests")));
                }

                if status == StatusCode::BAD_REQUEST {
                    return match response.json::<ErrorEnvelope>().await {
                        Ok(envelope) if envelope.error.is_transient => {
                            Err(RetryError::transient(envelope.error))
                        }
                        Ok(envelope) => Err(RetryError::permanent(envelope.error)),
                        Err(_) => Err(RetryError::permanent(anyhow!("bad request"))),
                    };
                }

                if !status.is_success() {
                    return Err(RetryError::permanent(anyhow!(
                        "unexpected status code {}",
                        status
                    )));
                }

                Ok(response)
            }
        })
        .await
    }
}

#[async_trait]
impl DocumentHelper for HelperClient {
    async fn count_document_tokens(&self, text: &str, cancel: &CancellationToken) -> Result<i64> {
        let _permit = self.acquire(cancel).await?;

        let body = serde_json::json!({ "document_text": text });
        let response = self
            .send(Method::POST, "count", body, cancel)
            .await
            .context("unable to count document tokens")?;

        #[derive(Deserialize)]
        struct CountResponse {
            token_count: i64,
        }

        let counted: CountResponse = response
            .json()
            .await
            .context("unable to decode count response")?;
        Ok(counted.token_count)
    }

    async fn ingest_document(
        &self,
        splitter: &TextSplitter,
        embeddings: &EmbeddingConfig,
        sinks: &[DataSink],
        openai_api_key: &str,
        document: &IndexedDocument,
        text: &str,
        metadata: &DocumentMetadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _permit = self.acquire(cancel).await?;

        let body = serde_json::json!({
            "document": document,
            "document_text": text,
            "document_metadata": metadata,
            "text_splitter": splitter,
            "embeddings": embeddings,
            "data_sinks": sinks,
            "openai_api_key": openai_api_key,
        });

        self.send(Method::POST, "ingest", body, cancel)
            .await
            .context("unable to ingest document")?;
        Ok(())
    }

    async fn delete_document(
        &self,
        sinks: &[DataSink],
        integration: Integration,
        document_type: &str,
        document_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _permit = self.acquire(cancel).await?;

        let body = serde_json::json!({
            "integration": integration,
            "document_type": document_type,
            "data_sinks": sinks,
        });

        self.send(
            Method::DELETE,
            &format!("documents/{}", document_id),
            body,
            cancel,
        )
        .await
        .context("unable to delete document")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn count_decodes_token_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/count"))
            .and(body_partial_json(serde_json::json!({
                "document_text": "hello world"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token_count": 42
            })))
            .mount(&server)
            .await;

        let client = HelperClient::new(server.uri()).unwrap();
        let count = client
            .count_document_tokens("hello world", &cancel())
            .await
            .unwrap();
        assert_eq!(count, 42);
    }

    #[tokio::test]
    async fn retries_once_on_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/count"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token_count": 7
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HelperClient::new(server.uri()).unwrap();
        let count = client.count_document_tokens("x", &cancel()).await.unwrap();
        assert_eq!(count, 7);
    }

    #[tokio::test]
    async fn flagged_content_is_permanent_and_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "code": "flagged_content",
                    "message": "document rejected by moderation",
                    "is_transient": false
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HelperClient::new(server.uri()).unwrap();
        let doc = IndexedDocument {
            integration: Integration::Notion,
            document_type: "page".into(),
            id: "p1".into(),
            title: "t".into(),
            url: "u".into(),
            freshness_indicator: "f".into(),
        };
        let splitter = TextSplitter::RecursiveCharacter {
            config: crate::models::RecursiveCharacterConfig {
                chunk_size: 500,
                chunk_overlap: 50,
                separators: vec!["\n".into()],
            },
        };
        let embeddings = EmbeddingConfig::Openai {
            config: crate::models::OpenAiEmbeddingConfig {
                api_key: String::new(),
            },
        };

        let err = client
            .ingest_document(
                &splitter,
                &embeddings,
                &[],
                "sk-test",
                &doc,
                "text",
                &DocumentMetadata::new(),
                &cancel(),
            )
            .await
            .unwrap_err();

        assert!(is_flagged_content(&err), "chain: {:#}", err);
    }

    #[tokio::test]
    async fn transient_helper_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/documents/d1"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "code": "vector_store_delete_failed",
                    "message": "store briefly unavailable",
                    "is_transient": true
                }
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/documents/d1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = HelperClient::new(server.uri()).unwrap();
        client
            .delete_document(&[], Integration::Linear, "issue", "d1", &cancel())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_error_code_is_tolerated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/count"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "code": "brand_new_code",
                    "message": "??",
                    "is_transient": false
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HelperClient::new(server.uri()).unwrap();
        let err = client.count_document_tokens("x", &cancel()).await.unwrap_err();
        let helper_err = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<HelperError>())
            .expect("typed helper error in chain");
        assert_eq!(helper_err.code, HelperErrorCode::Unknown);
        assert!(!is_flagged_content(&err));
    }

    #[tokio::test]
    async fn server_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/count"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = HelperClient::new(server.uri()).unwrap();
        let err = client.count_document_tokens("x", &cancel()).await.unwrap_err();
        assert!(err.to_string().contains("unable to count"));
    }
}
