//! HTTP client for posting messages to Slack-compatible webhooks.
//!
//! Sends one JSON POST per call and classifies the result into the error
//! taxonomy used by retry and circuit breaker decisions. Retrying is the
//! dispatcher's job; this client performs exactly one request.

use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header::HeaderMap, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use herald_core::{EventId, MessageId, RepositoryId};

use crate::error::{DeliveryError, Result};

/// Response bodies longer than this are truncated in errors and logs.
const MAX_ERROR_BODY_BYTES: usize = 1024;

/// Configuration for the webhook client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-request timeout, connect included.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Redirects followed before giving up.
    pub max_redirects: u32,
    /// Verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("Herald-Notifier/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// One POST to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Message being delivered.
    pub message_id: MessageId,
    /// Source event.
    pub event_id: EventId,
    /// Owning repository, for log context.
    pub repository_id: RepositoryId,
    /// Webhook URL.
    pub url: String,
    /// Serialized JSON body.
    pub body: Bytes,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

/// Successful (2xx) webhook response.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated.
    pub body: String,
    /// Request round-trip time.
    pub duration: Duration,
}

/// HTTP client shared by all workers.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    /// Builds a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the underlying HTTP
    /// client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Builds a client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Posts the message once.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the request exceeds the configured timeout
    /// - `NetworkError` for connection and protocol failures
    /// - `RateLimited` for 429, with the parsed `Retry-After`
    /// - `ClientError` for other non-2xx, non-5xx statuses
    /// - `ServerError` for 5xx
    pub async fn send(&self, request: WebhookRequest) -> Result<WebhookResponse> {
        let span = info_span!(
            "webhook_delivery",
            repository = %request.repository_id,
            event_id = %request.event_id,
            message_id = %request.message_id,
            attempt = request.attempt_number,
        );

        async move {
            let started = Instant::now();
            debug!(url = %request.url, "posting message");

            let result = self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header("X-Herald-Message-Id", request.message_id.to_string())
                .header("X-Herald-Attempt", request.attempt_number.to_string())
                .body(request.body)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    warn!(duration_ms = started.elapsed().as_millis(), error = %e, "request failed");
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let duration = started.elapsed();
            let status = response.status();
            debug!(status = status.as_u16(), duration_ms = duration.as_millis(), "received response");

            classify(response, duration).await
        }
        .instrument(span)
        .await
    }
}

async fn classify(response: Response, duration: Duration) -> Result<WebhookResponse> {
    let status = response.status();
    let retry_after = extract_retry_after_seconds(response.headers(), Utc::now());
    let body = read_body(response).await;

    if status.is_success() {
        return Ok(WebhookResponse { status_code: status.as_u16(), body, duration });
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!(retry_after_secs = ?retry_after, "rate limited by webhook");
        return Err(DeliveryError::rate_limited(retry_after));
    }

    if status.is_server_error() {
        warn!(status = status.as_u16(), "server error response");
        return Err(DeliveryError::server_error(status.as_u16(), body));
    }

    warn!(status = status.as_u16(), body = %body, "webhook rejected message");
    Err(DeliveryError::client_error(status.as_u16(), body))
}

async fn read_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_ERROR_BODY_BYTES => {
            let truncated = String::from_utf8_lossy(&bytes[..MAX_ERROR_BODY_BYTES]);
            format!("{truncated}... (truncated)")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

/// Parses `Retry-After` as delta-seconds or an HTTP date.
///
/// Returns `None` if the header is missing or unparsable so the caller
/// falls back to its own backoff. Dates in the past yield zero.
pub fn extract_retry_after_seconds(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some(at.signed_duration_since(now).to_std().map_or(0, |d| d.as_secs()))
}
