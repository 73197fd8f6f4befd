//! Durable job queue: wire client and consumer loop.
//!
//! The queue speaks the SQS JSON protocol. Requests are signed with AWS
//! Signature V4 implemented directly over `reqwest` with pure-Rust crypto
//! (`hmac` + `sha2`) — no AWS SDK, and therefore no C library dependencies.
//!
//! # Delivery semantics
//!
//! At-least-once. Each consumer:
//!
//! 1. Long-polls for **one** message (wait 10 s, initial visibility 20 s).
//!    One message per receive keeps per-message heartbeating trivial.
//! 2. Drives the handler under a heartbeat: every 5 s the message's
//!    visibility is extended by 15 s, so a healthy handler keeps exclusive
//!    ownership indefinitely.
//! 3. On success, deletes the message. On handler failure or process
//!    shutdown, resets visibility to 0 so another worker picks the message
//!    up immediately. No message is lost on graceful shutdown.
//!
//! The heartbeat loop is owned by the consumer frame, not the handler, so a
//! misbehaving handler cannot leak a message: dropping the handler future on
//! cancellation still releases visibility.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Long-poll wait per receive call.
pub const RECEIVE_WAIT_SECONDS: u32 = 10;
/// Initial visibility, long enough for the first heartbeat to land.
pub const INITIAL_VISIBILITY_SECONDS: u32 = 20;
/// Heartbeat period while a handler is running.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Visibility extension applied by each heartbeat.
pub const HEARTBEAT_EXTENSION_SECONDS: u32 = 15;

/// One received queue message.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// Queue operations the consumer needs.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Receive up to one message, long-polling up to the configured wait.
    async fn receive(&self) -> Result<Vec<QueueMessage>>;

    /// Acknowledge and remove a message.
    async fn delete(&self, receipt_handle: &str) -> Result<()>;

    /// Change a message's remaining visibility timeout (0 releases it).
    async fn change_visibility(&self, receipt_handle: &str, timeout_seconds: u32) -> Result<()>;
}

/// A message processor. Returning an error requests redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage, cancel: &CancellationToken) -> Result<()>;
}

// ============ SigV4-signed queue client ============

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Queue client speaking the SQS JSON protocol against the queue URL's host.
pub struct SqsQueue {
    http: reqwest::Client,
    queue_url: String,
    endpoint: String,
    host: String,
    region: String,
    credentials: AwsCredentials,
}

impl SqsQueue {
    /// Build a client for one queue. Credentials are read from the
    /// environment once, at construction.
    pub fn new(queue_url: impl Into<String>, region: impl Into<String>) -> Result<Self> {
        let queue_url = queue_url.into();
        let parsed = reqwest::Url::parse(&queue_url)
            .with_context(|| format!("invalid queue URL: {:?}", queue_url))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow!("queue URL has no host: {:?}", queue_url))?
            .to_string();
        let host = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        };
        let endpoint = format!("{}://{}/", parsed.scheme(), host);

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            queue_url,
            endpoint,
            host,
            region: region.into(),
            credentials: AwsCredentials::from_env()?,
        })
    }

    /// Sign and send one protocol action, returning the decoded body.
    async fn call(&self, action: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let body = serde_json::to_string(payload)?;
        let payload_hash = hex_sha256(body.as_bytes());

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let target = format!("AmazonSQS.{}", action);

        // Headers participating in the signature, sorted by name
        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
            ("x-amz-target".to_string(), target.clone()),
        ];
        if let Some(ref token) = self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "POST\n/\n\n{}\n{}\n{}",
            canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/sqs/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.credentials.secret_access_key,
            &date_stamp,
            &self.region,
            "sqs",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.credentials.access_key_id, credential_scope, signed_headers, signature
        );

        let mut request = self
            .http
            .post(&self.endpoint)
            .header("Authorization", &authorization)
            .header("Content-Type", "application/x-amz-json-1.0")
            .header("X-Amz-Target", &target)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date)
            .body(body);

        if let Some(ref token) = self.credentials.session_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!(
                "{} failed (HTTP {}): {}",
                action,
                status,
                text.chars().take(500).collect::<String>()
            );
        }

        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("undecodable {} response", action))
    }
}

#[async_trait]
impl JobQueue for SqsQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>> {
        let response = self
            .call(
                "ReceiveMessage",
                &serde_json::json!({
                    "QueueUrl": self.queue_url,
                    "MaxNumberOfMessages": 1,
                    "WaitTimeSeconds": RECEIVE_WAIT_SECONDS,
                    "VisibilityTimeout": INITIAL_VISIBILITY_SECONDS,
                }),
            )
            .await?;

        let Some(messages) = response.get("Messages").and_then(|m| m.as_array()) else {
            return Ok(Vec::new());
        };

        messages
            .iter()
            .map(|message| {
                Ok(QueueMessage {
                    message_id: message
                        .get("MessageId")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    receipt_handle: message
                        .get("ReceiptHandle")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow!("message without receipt handle"))?
                        .to_string(),
                    body: message
                        .get("Body")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect()
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.call(
            "DeleteMessage",
            &serde_json::json!({
                "QueueUrl": self.queue_url,
                "ReceiptHandle": receipt_handle,
            }),
        )
        .await?;
        Ok(())
    }

    async fn change_visibility(&self, receipt_handle: &str, timeout_seconds: u32) -> Result<()> {
        self.call(
            "ChangeMessageVisibility",
            &serde_json::json!({
                "QueueUrl": self.queue_url,
                "ReceiptHandle": receipt_handle,
                "VisibilityTimeout": timeout_seconds,
            }),
        )
        .await?;
        Ok(())
    }
}

// ============ Consumer loop ============

/// How one message's processing ended.
enum DriveOutcome {
    /// The handler returned; carries its result.
    Handled(Result<()>),
    /// Shutdown fired mid-processing; the handler future was dropped.
    Cancelled,
}

/// Run the handler while heartbeating the message's visibility.
async fn drive_with_heartbeat(
    queue: &dyn JobQueue,
    handler: &dyn MessageHandler,
    message: &QueueMessage,
    cancel: &CancellationToken,
) -> DriveOutcome {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval completes immediately; the message
    // already has its initial visibility, so skip it.
    heartbeat.tick().await;

    let handler_future = handler.handle(message, cancel);
    tokio::pin!(handler_future);

    loop {
        tokio::select! {
            result = &mut handler_future => return DriveOutcome::Handled(result),
            _ = heartbeat.tick() => {
                match queue
                    .change_visibility(&message.receipt_handle, HEARTBEAT_EXTENSION_SECONDS)
                    .await
                {
                    Ok(()) => {
                        tracing::debug!(message_id = %message.message_id, "extended message visibility");
                    }
                    Err(err) => {
                        tracing::warn!(message_id = %message.message_id, error = %err, "unable to change message visibility");
                    }
                }
            }
            _ = cancel.cancelled() => return DriveOutcome::Cancelled,
        }
    }
}

/// Release a message for immediate redelivery. Failures are logged, never
/// propagated: the visibility timeout will release it anyway.
async fn release_message(queue: &dyn JobQueue, message: &QueueMessage) {
    if let Err(err) = queue.change_visibility(&message.receipt_handle, 0).await {
        tracing::warn!(
            message_id = %message.message_id,
            error = %err,
            "unable to reset message visibility"
        );
    }
}

/// Spawn one consumer worker. The task exits when `cancel` fires, after
/// releasing any in-flight message.
pub fn start_consumer(
    worker: usize,
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(worker, "consumer started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let received = tokio::select! {
                received = queue.receive() => received,
                _ = cancel.cancelled() => break,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!(worker, error = %err, "unable to receive message");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = cancel.cancelled() => break,
                    }
                    continue;
                }
            };

            for message in messages {
                tracing::info!(worker, message_id = %message.message_id, "processing message");

                match drive_with_heartbeat(queue.as_ref(), handler.as_ref(), &message, &cancel)
                    .await
                {
                    DriveOutcome::Handled(Ok(())) => {
                        if let Err(err) = queue.delete(&message.receipt_handle).await {
                            tracing::warn!(
                                worker,
                                message_id = %message.message_id,
                                error = %err,
                                "unable to delete message"
                            );
                            continue;
                        }
                        tracing::info!(worker, message_id = %message.message_id, "deleted message");
                    }
                    DriveOutcome::Handled(Err(err)) => {
                        tracing::warn!(
                            worker,
                            message_id = %message.message_id,
                            error = %format!("{:#}", err),
                            "unable to process message, releasing for redelivery"
                        );
                        release_message(queue.as_ref(), &message).await;
                    }
                    DriveOutcome::Cancelled => {
                        tracing::info!(
                            worker,
                            message_id = %message.message_id,
                            "shutdown during processing, releasing message"
                        );
                        release_message(queue.as_ref(), &message).await;
                    }
                }
            }
        }

        tracing::info!(worker, "consumer stopped");
    })
}
