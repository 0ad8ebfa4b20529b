//! Delivers one outbound message to its webhook.
//!
//! Owns the retry loop for a single message: consults the circuit for the
//! target, posts through [`WebhookClient`], and either waits out a backoff
//! or gives up according to the [`RetryPolicy`]. Backoff sleeps go through
//! the injected clock and end early on cancellation. A request already on
//! the wire is never aborted.

use std::sync::Arc;

use bytes::Bytes;
use herald_core::{Clock, DeliveryOutcome, DeliveryStatus, OutboundMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    circuit::CircuitBreakerManager,
    client::{WebhookClient, WebhookRequest},
    error::{DeliveryError, ErrorCategory},
    retry::{RetryDecision, RetryPolicy},
};

/// Dispatches formatted messages with retries and circuit breaking.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: Arc<WebhookClient>,
    circuits: CircuitBreakerManager,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    cancellation: CancellationToken,
}

impl WebhookDispatcher {
    /// Creates a dispatcher.
    pub fn new(
        client: Arc<WebhookClient>,
        circuits: CircuitBreakerManager,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        cancellation: CancellationToken,
    ) -> Self {
        Self { client, circuits, policy, clock, cancellation }
    }

    /// Circuit registry used by this dispatcher.
    pub fn circuits(&self) -> &CircuitBreakerManager {
        &self.circuits
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delivers a message, retrying transient failures.
    ///
    /// Always returns a terminal outcome. Messages whose circuit is open are
    /// reported as `CircuitOpen` without any HTTP request. Cancellation
    /// during a backoff wait ends the message as `Dropped`.
    pub async fn deliver(&self, mut message: OutboundMessage) -> DeliveryOutcome {
        if let Err(err) = self.circuits.try_acquire(&message.target_url).await {
            info!(
                repository = %message.repository_id,
                message_id = %message.id,
                "circuit open, skipping delivery"
            );
            return self.outcome(&message, DeliveryStatus::CircuitOpen, None, Some(err.to_string()));
        }

        let body = match message.body_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!(message_id = %message.id, error = %e, "failed to serialize message body");
                self.circuits.record_abandoned(&message.target_url).await;
                return self.outcome(
                    &message,
                    DeliveryStatus::DroppedPermanent,
                    None,
                    Some(e.to_string()),
                );
            },
        };

        loop {
            message.attempt_count += 1;
            let attempt = message.attempt_count;

            let request = WebhookRequest {
                message_id: message.id,
                event_id: message.event_id,
                repository_id: message.repository_id.clone(),
                url: message.target_url.clone(),
                body: body.clone(),
                attempt_number: attempt,
            };

            let err = match self.client.send(request).await {
                Ok(response) => {
                    self.circuits.record_success(&message.target_url).await;
                    info!(
                        repository = %message.repository_id,
                        message_id = %message.id,
                        attempt,
                        status = response.status_code,
                        duration_ms = response.duration.as_millis(),
                        "message delivered"
                    );
                    return self.outcome(
                        &message,
                        DeliveryStatus::Delivered,
                        Some(response.status_code),
                        None,
                    );
                },
                Err(err) => err,
            };

            match self.policy.decide(attempt, &err) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        repository = %message.repository_id,
                        message_id = %message.id,
                        attempt,
                        category = %ErrorCategory::from(&err),
                        error = %err,
                        delay_ms = delay.as_millis(),
                        "delivery failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        () = self.cancellation.cancelled() => {
                            debug!(message_id = %message.id, "backoff interrupted by shutdown");
                            self.circuits.record_abandoned(&message.target_url).await;
                            return self.outcome(
                                &message,
                                DeliveryStatus::Dropped,
                                err.http_status(),
                                Some(format!("shutdown during backoff: {err}")),
                            );
                        }
                        () = self.clock.sleep(delay) => {}
                    }
                },
                RetryDecision::GiveUp { reason } => {
                    let status = terminal_status(&err);
                    // Only refusals count toward opening the circuit.
                    if status == DeliveryStatus::DroppedPermanent {
                        self.circuits.record_failure(&message.target_url).await;
                    } else {
                        self.circuits.record_abandoned(&message.target_url).await;
                    }
                    warn!(
                        repository = %message.repository_id,
                        message_id = %message.id,
                        attempts = attempt,
                        status = %status,
                        category = %ErrorCategory::from(&err),
                        error = %err,
                        reason = %reason,
                        "delivery abandoned"
                    );
                    return self.outcome(&message, status, err.http_status(), Some(err.to_string()));
                },
            }
        }
    }

    fn outcome(
        &self,
        message: &OutboundMessage,
        status: DeliveryStatus,
        http_status: Option<u16>,
        error: Option<String>,
    ) -> DeliveryOutcome {
        DeliveryOutcome {
            message_id: message.id,
            event_id: message.event_id,
            repository_id: message.repository_id.clone(),
            target_url: message.target_url.clone(),
            status,
            http_status,
            error,
            attempts: message.attempt_count,
            completed_at: self.clock.now_utc(),
        }
    }
}

/// Retryable errors that run out of attempts are `Dropped`; everything
/// else the webhook refused outright.
fn terminal_status(err: &DeliveryError) -> DeliveryStatus {
    if err.is_retryable() {
        DeliveryStatus::Dropped
    } else {
        DeliveryStatus::DroppedPermanent
    }
}
