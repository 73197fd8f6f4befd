//! Issue-tracker (Linear) source client.
//!
//! Talks GraphQL: one query lists issues with cursor pagination, another
//! fetches a single issue; both share the same field selection. The
//! provider signals rate limiting through a GraphQL error with extension
//! code `RATELIMITED`, which is the only non-2xx treated as transient.
//!
//! Issue content is projected as `# {title}` followed by the description;
//! creator/assignee/state travel as metadata for the helper to attach to
//! chunks.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::models::{Integration, IntegrationConnection, IndexedDocument};
use crate::retry::{retry_with_backoff, RetryError};
use crate::sources::{DocumentMetadata, SourceClient};

/// Results per page for issue listing.
const PAGE_SIZE: u32 = 100;
/// Retry budget for listing and detail calls.
const MAX_ATTEMPTS: u32 = 10;
/// In-flight request cap, per the provider's published complexity limits.
const MAX_IN_FLIGHT: usize = 5;

/// The only document type this integration produces.
const DOCUMENT_TYPE_ISSUE: &str = "issue";

/// Field selection shared by the list and detail queries.
const ISSUE_FRAGMENT: &str = r#"id
      title
      updatedAt
      url
      description
      creator {
        id
        name
        email
        displayName
      }
      assignee {
        id
        name
        email
        displayName
      }
      state {
        name
        type
      }"#;

pub struct LinearClient {
    http: reqwest::Client,
    api_base: String,
    semaphore: Semaphore,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Person {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IssueState {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Issue {
    id: String,
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "updatedAt", default)]
    updated_at: String,
    #[serde(default)]
    creator: Option<Person>,
    #[serde(default)]
    assignee: Option<Person>,
    #[serde(default)]
    state: Option<IssueState>,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    #[serde(rename = "endCursor")]
    end_cursor: Option<String>,
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    extensions: GraphqlErrorExtensions,
}

#[derive(Debug, Default, Deserialize)]
struct GraphqlErrorExtensions {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlErrorResponse {
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

impl LinearClient {
    /// Production client against the public API.
    pub fn new() -> Result<Self> {
        Self::with_api_base("https://api.linear.app")
    }

    /// Client with an overridable API base, for tests.
    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            api_base: api_base.into(),
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
            IntegrationConnection::Linear { config, .. } => Ok(&config.access_token),
            other => bail!(
                "connection is for integration {:?}, expected linear",
                other.integration()
            ),
        }
    }

    /// Execute one GraphQL request under the retry budget.
    async fn graphql<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let url = format!("{}/graphql", self.api_base.trim_end_matches('/'));

        let response = retry_with_backoff(MAX_ATTEMPTS, cancel, || {
            let request = self
                .http
                .post(&url)
                .bearer_auth(token)
                .header("Content-Type", "application/json")
                .json(body);

            async move {
                let response = request.send().await.map_err(|err| {
                    if err.is_timeout() {
                        RetryError::transient(err)
                    } else {
                        RetryError::permanent(err)
                    }
                })?;

                let status = response.status();
                if status == StatusCode::OK {
                    return Ok(response);
                }

                // The provider reports rate limiting as a GraphQL error
                // body, not a bare 429.
                let decoded = response.json::<GraphqlErrorResponse>().await.map_err(|err| {
                    RetryError::permanent(
                        anyhow!(err).context(format!("undecodable error response ({})", status)),
                    )
                })?;

                let Some(first) = decoded.errors.into_iter().next() else {
                    return Err(RetryError::permanent(anyhow!(
                        "unexpected error {}",
                        status
                    )));
                };

                if first.extensions.code == "RATELIMITED" {
                    return Err(RetryError::transient(anyhow!("rate limited")));
                }

                Err(RetryError::permanent(anyhow!(
                    "unexpected error {:?}: {}",
                    first.extensions.code,
                    first.message
                )))
            }
        })
        .await?;

        response
            .json::<T>()
            .await
            .context("unable to decode response")
    }

    async fn list_issues(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, IndexedDocument>> {
        let mut documents = HashMap::new();
        let mut cursor: Option<String> = None;

        loop {
            let body = serde_json::json!({
                "variables": { "after": &cursor, "first": PAGE_SIZE },
                "query": format!(
                    "query getIssues($after: String, $first: Int) {{\n  issues(after: $after, first: $first) {{\n    nodes {{\n      {}\n    }}\n    pageInfo {{\n      endCursor\n      hasNextPage\n    }}\n  }}\n}}",
                    ISSUE_FRAGMENT
                ),
            });

            #[derive(Deserialize)]
            struct Issues {
                nodes: Vec<Issue>,
                #[serde(rename = "pageInfo")]
                page_info: PageInfo,
            }
            #[derive(Deserialize)]
            struct Data {
                issues: Issues,
            }
            #[derive(Deserialize)]
            struct ListResponse {
                data: Data,
            }

            let page: ListResponse = self.graphql(token, &body, cancel).await?;
            for issue in page.data.issues.nodes {
                documents.insert(issue.id.clone(), issue_to_document(&issue));
            }

            if !page.data.issues.page_info.has_next_page {
                break;
            }
            cursor = page.data.issues.page_info.end_cursor;
        }

        Ok(documents)
    }

    async fn get_issue(
        &self,
        token: &str,
        issue_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Issue> {
        let body = serde_json::json!({
            "variables": { "issueId": issue_id },
            "query": format!(
                "query getIssue($issueId: String!) {{\n  issue(id: $issueId) {{\n    {}\n  }}\n}}",
                ISSUE_FRAGMENT
            ),
        });

        #[derive(Deserialize)]
        struct Data {
            issue: Issue,
        }
        #[derive(Deserialize)]
        struct IssueResponse {
            data: Data,
        }

        let response: IssueResponse = self.graphql(token, &body, cancel).await?;
        Ok(response.data.issue)
    }
}

fn issue_to_document(issue: &Issue) -> IndexedDocument {
    IndexedDocument {
        integration: Integration::Linear,
        document_type: DOCUMENT_TYPE_ISSUE.to_string(),
        id: issue.id.clone(),
        title: issue.title.clone(),
        url: issue.url.clone(),
        freshness_indicator: issue.updated_at.clone(),
    }
}

#[async_trait]
impl SourceClient for LinearClient {
    async fn list_documents(
        &self,
        connection: &IntegrationConnection,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, IndexedDocument>> {
        let _permit = self.acquire(cancel).await?;
        let token = self.access_token(connection)?;

        tracing::info!("listing all issues");
        self.list_issues(token, cancel).await
    }

    async fn get_document(
        &self,
        document_type: &str,
        id: &str,
        connection: &IntegrationConnection,
        cancel: &CancellationToken,
    ) -> Result<IndexedDocument> {
        let _permit = self.acquire(cancel).await?;
        let token = self.access_token(connection)?;

        match document_type {
            DOCUMENT_TYPE_ISSUE => {
                let issue = self.get_issue(token, id, cancel).await?;
                Ok(issue_to_document(&issue))
            }
            other => bail!("unknown document type {:?}", other),
        }
    }

    async fn get_document_content(
        &self,
        document_type: &str,
        id: &str,
        connection: &IntegrationConnection,
        cancel: &CancellationToken,
    ) -> Result<(String, DocumentMetadata)> {
        let _permit = self.acquire(cancel).await?;
        let token = self.access_token(connection)?;

        match document_type {
            DOCUMENT_TYPE_ISSUE => {
                let issue = self.get_issue(token, id, cancel).await?;

                let text = format!("# {}\n{}", issue.title, issue.description);

                let creator = serde_json::to_string(&issue.creator.clone().unwrap_or_default())?;
                let assignee = serde_json::to_string(&issue.assignee.clone().unwrap_or_default())?;
                let state = issue.state.clone().unwrap_or_default();

                let mut metadata = DocumentMetadata::new();
                metadata.insert("title".into(), serde_json::json!(issue.title));
                metadata.insert("creator".into(), serde_json::json!(creator));
                metadata.insert("assignee".into(), serde_json::json!(assignee));
                metadata.insert("state".into(), serde_json::json!(state.name));

                Ok((text, metadata))
            }
            other => bail!("unknown document type {:?}", other),
        }
    }
}
