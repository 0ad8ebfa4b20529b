//! Outcome recording for asserting on notifier behaviour.

use std::time::Duration;

use herald_core::{DeliveryOutcome, DeliveryStatus, NotificationEvent, OutcomeHandler};
use tokio::sync::{Mutex, Notify};

/// Upper bound for waits so a broken test fails instead of hanging CI.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome handler that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<NotificationEvent>>,
    notify: Notify,
}

impl RecordingHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in arrival order.
    pub async fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().await.clone()
    }

    /// Number of events recorded.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Whether nothing has been recorded.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Delivery outcomes recorded so far.
    pub async fn outcomes(&self) -> Vec<DeliveryOutcome> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                NotificationEvent::Completed(outcome) => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    /// Statuses of recorded delivery outcomes, in arrival order.
    pub async fn statuses(&self) -> Vec<DeliveryStatus> {
        self.outcomes().await.iter().map(|outcome| outcome.status).collect()
    }

    /// Waits until at least `count` events are recorded.
    ///
    /// # Panics
    ///
    /// Panics after [`DEFAULT_EVENT_TIMEOUT`].
    pub async fn wait_for(&self, count: usize) {
        let result = tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.len().await >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        if result.is_err() {
            panic!(
                "expected {count} notification events within {DEFAULT_EVENT_TIMEOUT:?}, got {}",
                self.len().await
            );
        }
    }
}

#[async_trait::async_trait]
impl OutcomeHandler for RecordingHandler {
    async fn handle(&self, event: NotificationEvent) {
        self.events.lock().await.push(event);
        self.notify.notify_waiters();
    }
}
