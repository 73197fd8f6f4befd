//! Knowledge-base (Notion) source client.
//!
//! Listing is a union of two independently paginated queries: the search
//! endpoint filtered to free pages, and every page belonging to each
//! discovered database. Entries are keyed by page id, so database pages
//! override free-page entries for the same id.
//!
//! Content retrieval is delegated to the markdown sidecar
//! (`POST {helper}/notion/markdown`), which walks the block tree and
//! renders it — the worker never touches block structure.
//!
//! The provider allows 3 requests per second; we cap in-flight requests at
//! 3 and still handle 429s via the retry budget, since individual requests
//! can complete faster than the window.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::models::{Integration, IntegrationConnection, IndexedDocument};
use crate::retry::{retry_with_backoff, RetryError};
use crate::sources::{DocumentMetadata, SourceClient};

/// Provider API version header value.
const API_VERSION: &str = "2022-06-28";
/// Results per page for all paginated queries.
const PAGE_SIZE: u32 = 100;
/// Retry budget for listing and detail calls.
const MAX_ATTEMPTS: u32 = 10;
/// In-flight request cap, matching the provider rate limit.
const MAX_IN_FLIGHT: usize = 3;

/// The only document type this integration produces.
const DOCUMENT_TYPE_PAGE: &str = "page";

pub struct NotionClient {
    http: reqwest::Client,
    api_base: String,
    helper_endpoint: String,
    semaphore: Semaphore,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    id: String,
    #[serde(default)]
    last_edited_time: String,
    #[serde(default)]
    properties: serde_json::Value,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchPage>,
    next_cursor: Option<String>,
    has_more: bool,
}

impl NotionClient {
    /// Production client against the public API.
    pub fn new(helper_endpoint: impl Into<String>) -> Result<Self> {
        Self::with_api_base("https://api.notion.com", helper_endpoint)
    }

    /// Client with an overridable API base, for tests.
    pub fn with_api_base(
        api_base: impl Into<String>,
        helper_endpoint: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            // Markdown rendering of a large page tree can be slow
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()?,
            api_base: api_base.into(),
            helper_endpoint: helper_endpoint.into(),
            semaphore: Semaphore::new(MAX_IN_FLIGHT),
        })
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<tokio::sync::SemaphorePermit<'_>> {
        tokio::select! {
            permit = self.semaphore.acquire() => Ok(permit?),
            _ = cancel.cancelled() => Err(anyhow!("cancelled while waiting for request slot")),
        }
    }

    fn access_token<'a>(&self, connection: &'a IntegrationConnection) -> Result<&'a str> {
        match connection {
            IntegrationConnection::Notion { config, .. } => Ok(&config.access_token),
            other => bail!(
                "connection is for integration {:?}, expected notion",
                other.integration()
            ),
        }
    }

    /// POST a JSON body and decode the response, under the retry budget.
    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let response = retry_with_backoff(MAX_ATTEMPTS, cancel, || {
            let request = self
                .http
                .post(url)
                .bearer_auth(token)
                .header("Notion-Version", API_VERSION)
                .header("Content-Type", "application/json")
                .json(body);
            async move { classify_response(request.send().await).await }
        })
        .await?;

        response
            .json::<T>()
            .await
            .context("unable to decode response")
    }

    async fn load_free_pages(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, IndexedDocument>> {
        let url = format!("{}/v1/search", self.api_base);
        let mut documents = HashMap::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = serde_json::json!({
                "query": "",
                "page_size": PAGE_SIZE,
                "filter": { "property": "object", "value": "page" },
            });
            if let Some(ref cursor) = cursor {
                body["start_cursor"] = serde_json::json!(cursor);
            }

            let page: SearchResponse = self.post_json(&url, token, &body, cancel).await?;
            for result in page.results {
                documents.insert(result.id.clone(), page_to_document(result));
            }

            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        Ok(documents)
    }

    async fn load_database_ids(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let url = format!("{}/v1/search", self.api_base);
        let mut database_ids = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = serde_json::json!({
                "query": "",
                "page_size": PAGE_SIZE,
                "filter": { "property": "object", "value": "database" },
            });
            if let Some(ref cursor) = cursor {
                body["start_cursor"] = serde_json::json!(cursor);
            }

            let page: SearchResponse = self.post_json(&url, token, &body, cancel).await?;
            database_ids.extend(page.results.into_iter().map(|result| result.id));

            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        Ok(database_ids)
    }

    async fn load_database_pages(
        &self,
        token: &str,
        database_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexedDocument>> {
        let url = format!("{}/v1/databases/{}/query", self.api_base, database_id);
        let mut documents = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = serde_json::json!({ "page_size": PAGE_SIZE });
            if let Some(ref cursor) = cursor {
                body["start_cursor"] = serde_json::json!(cursor);
            }

            let page: SearchResponse = self.post_json(&url, token, &body, cancel).await?;
            documents.extend(page.results.into_iter().map(page_to_document));

            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        Ok(documents)
    }
}

/// Classify a response per the shared HTTP taxonomy: timeouts and 429 are
/// transient, everything else non-2xx is permanent.
async fn classify_response(
    result: std::result::Result<reqwest::Response, reqwest::Error>,
) -> std::result::Result<reqwest::Response, RetryError> {
    let response = result.map_err(|err| {
        if err.is_timeout() {
            RetryError::transient(err)
        } else {
            RetryError::permanent(err)
        }
    })?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(RetryError::transient(anyhow!("rate limited")));
    }
    if !status.is_success() {
        return Err(RetryError::permanent(anyhow!(
            "unexpected status code: {}",
            status
        )));
    }
    Ok(response)
}

fn page_to_document(page: SearchPage) -> IndexedDocument {
    IndexedDocument {
        integration: Integration::Notion,
        document_type: DOCUMENT_TYPE_PAGE.to_string(),
        title: extract_title(&page.properties),
        id: page.id,
        url: page.url,
        freshness_indicator: page.last_edited_time,
    }
}

/// Pull the page title out of the properties map: find the property of type
/// `title` and concatenate its rich-text runs.
fn extract_title(properties: &serde_json::Value) -> String {
    let Some(properties) = properties.as_object() else {
        return String::new();
    };

    for property in properties.values() {
        if property.get("type").and_then(|t| t.as_str()) != Some("title") {
            continue;
        }
        let Some(runs) = property.get("title").and_then(|t| t.as_array()) else {
            continue;
        };
        return runs
            .iter()
            .filter_map(|run| run.get("plain_text").and_then(|t| t.as_str()))
            .collect();
    }

    String::new()
}

#[async_trait]
impl SourceClient for NotionClient {
    async fn list_documents(
        &self,
        connection: &IntegrationConnection,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, IndexedDocument>> {
        let _permit = self.acquire(cancel).await?;
        let token = self.access_token(connection)?;

        tracing::info!("listing all knowledge-base pages");
        let mut documents = self.load_free_pages(token, cancel).await?;

        tracing::info!("listing all knowledge-base databases");
        let database_ids = self.load_database_ids(token, cancel).await?;

        for database_id in &database_ids {
            tracing::debug!(database_id = %database_id, "listing database pages");
            let pages = self
                .load_database_pages(token, database_id, cancel)
                .await?;
            for page in pages {
                documents.insert(page.id.clone(), page);
            }
        }

        tracing::info!(count = documents.len(), "found shared pages");
        Ok(documents)
    }

    async fn get_document(
        &self,
        _document_type: &str,
        id: &str,
        connection: &IntegrationConnection,
        cancel: &CancellationToken,
    ) -> Result<IndexedDocument> {
        let _permit = self.acquire(cancel).await?;
        let token = self.access_token(connection)?;
        let url = format!("{}/v1/pages/{}", self.api_base, id);

        let response = retry_with_backoff(MAX_ATTEMPTS, cancel, || {
            let request = self
                .http
                .get(&url)
                .bearer_auth(token)
                .header("Notion-Version", API_VERSION)
                .header("Content-Type", "application/json");
            async move { classify_response(request.send().await).await }
        })
        .await?;

        let page: SearchPage = response.json().await.context("unable to decode page")?;
        Ok(page_to_document(page))
    }

    async fn get_document_content(
        &self,
        _document_type: &str,
        id: &str,
        connection: &IntegrationConnection,
        cancel: &CancellationToken,
    ) -> Result<(String, DocumentMetadata)> {
        let _permit = self.acquire(cancel).await?;
        let token = self.access_token(connection)?;

        let url = format!(
            "{}/notion/markdown",
            self.helper_endpoint.trim_end_matches('/')
        );
        let body = serde_json::json!({ "pageId": id, "token": token });

        let response = retry_with_backoff(MAX_ATTEMPTS, cancel, || {
            let request = self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&body);
            async move { classify_response(request.send().await).await }
        })
        .await
        .context("unable to get page markdown content")?;

        #[derive(Deserialize)]
        struct MarkdownResponse {
            markdown: String,
        }

        let rendered: MarkdownResponse = response
            .json()
            .await
            .context("unable to decode markdown response")?;

        Ok((rendered.markdown, DocumentMetadata::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connection() -> IntegrationConnection {
        serde_json::from_value(serde_json::json!({
            "integration_name": "notion",
            "account": "acct-1",
            "connected_at": "2024-01-01T00:00:00Z",
            "config": { "access_token": "secret-token" }
        }))
        .unwrap()
    }

    fn page_result(id: &str, title: &str, edited: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "last_edited_time": edited,
            "url": format!("https://notion.test/{}", id),
            "properties": {
                "Name": {
                    "type": "title",
                    "title": [{ "type": "text", "plain_text": title }]
                }
            }
        })
    }

    #[tokio::test]
    async fn listing_paginates_and_unions_database_pages() {
        let server = MockServer::start().await;

        // Free-page search: two pages of results
        Mock::given(method("POST"))
            .and(path("/v1/search"))
            .and(body_partial_json(serde_json::json!({
                "filter": { "value": "page" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [page_result("p1", "First", "2024-01-01")],
                "next_cursor": "cur-1",
                "has_more": true
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/search"))
            .and(body_partial_json(serde_json::json!({
                "filter": { "value": "page" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [page_result("p2", "Second", "2024-01-02")],
                "next_cursor": null,
                "has_more": false
            })))
            .mount(&server)
            .await;

        // One database, whose query overrides p2 and adds p3
        Mock::given(method("POST"))
            .and(path("/v1/search"))
            .and(body_partial_json(serde_json::json!({
                "filter": { "value": "database" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{ "id": "db-1", "properties": {} }],
                "next_cursor": null,
                "has_more": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    page_result("p2", "Second (db)", "2024-02-02"),
                    page_result("p3", "Third", "2024-01-03")
                ],
                "next_cursor": null,
                "has_more": false
            })))
            .mount(&server)
            .await;

        let client = NotionClient::with_api_base(server.uri(), "http://sidecar.test").unwrap();
        let documents = client
            .list_documents(&connection(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(documents.len(), 3);
        assert_eq!(documents["p1"].title, "First");
        // Database entry wins for the duplicated id
        assert_eq!(documents["p2"].title, "Second (db)");
        assert_eq!(documents["p2"].freshness_indicator, "2024-02-02");
        assert_eq!(documents["p3"].document_type, "page");
    }

    #[tokio::test]
    async fn get_document_retries_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/pages/p9"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/pages/p9"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(page_result("p9", "Ninth", "2024-03-03")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = NotionClient::with_api_base(server.uri(), "http://sidecar.test").unwrap();
        let document = client
            .get_document("page", "p9", &connection(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(document.id, "p9");
        assert_eq!(document.title, "Ninth");
        assert_eq!(document.freshness_indicator, "2024-03-03");
    }

    #[tokio::test]
    async fn content_comes_from_sidecar() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notion/markdown"))
            .and(body_partial_json(serde_json::json!({
                "pageId": "p1",
                "token": "secret-token"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "markdown": "# Rendered"
            })))
            .mount(&server)
            .await;

        let client = NotionClient::with_api_base("http://api.test", server.uri()).unwrap();
        let (text, metadata) = client
            .get_document_content("page", "p1", &connection(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(text, "# Rendered");
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/pages/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = NotionClient::with_api_base(server.uri(), "http://sidecar.test").unwrap();
        let err = client
            .get_document("page", "gone", &connection(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unexpected status code"));
    }

    #[test]
    fn title_extraction_concatenates_runs() {
        let properties = serde_json::json!({
            "Tags": { "type": "multi_select" },
            "Name": {
                "type": "title",
                "title": [
                    { "plain_text": "Hello, " },
                    { "plain_text": "world" }
                ]
            }
        });
        assert_eq!(extract_title(&properties), "Hello, world");
        assert_eq!(extract_title(&serde_json::json!({})), "");
        assert_eq!(extract_title(&serde_json::Value::Null), "");
    }
}
