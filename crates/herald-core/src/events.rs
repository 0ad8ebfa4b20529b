//! Notification lifecycle events and outcome handlers.
//!
//! The notifier reports every terminal disposition of a repository event
//! through an [`OutcomeHandler`]. Handlers observe; they never influence
//! delivery or settings.
//!
//! ```text
//! ┌───────────────┐  Filtered / FormatFailed /   ┌──────────────────────┐
//! │ Notifier core │  QueueOverflow / Completed   │ MulticastOutcome     │
//! │ and workers   │ ────────────────────────────▶│ Handler              │
//! └───────────────┘                              └──────────┬───────────┘
//!                                                           │
//!                                              ┌────────────┴─────────┐
//!                                              ▼                      ▼
//!                                       stats / logging        test recorders
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    DeliveryOutcome, EventId, EventType, MessageId, NotificationState, RepositoryId,
    SuppressReason,
};

/// Terminal dispositions reported by the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// Settings suppressed the event, either at intake or before dispatch.
    Filtered {
        /// Suppressed event.
        event_id: EventId,
        /// Owning repository.
        repository_id: RepositoryId,
        /// Event type.
        event_type: EventType,
        /// Why it was suppressed.
        reason: SuppressReason,
        /// When the decision was made.
        at: DateTime<Utc>,
    },

    /// The formatter could not render the event.
    FormatFailed {
        /// Dropped event.
        event_id: EventId,
        /// Owning repository.
        repository_id: RepositoryId,
        /// Formatter error text.
        error: String,
    },

    /// Settings could not be read, the event was dropped.
    SettingsUnavailable {
        /// Dropped event.
        event_id: EventId,
        /// Owning repository.
        repository_id: RepositoryId,
        /// Storage error text.
        error: String,
    },

    /// A message was rejected or evicted because its queue was full.
    QueueOverflow {
        /// Affected message.
        message_id: MessageId,
        /// Source event.
        event_id: EventId,
        /// Owning repository.
        repository_id: RepositoryId,
        /// True if an already queued message was evicted to make room.
        evicted: bool,
    },

    /// Delivery reached a terminal outcome.
    Completed(DeliveryOutcome),
}

impl NotificationEvent {
    /// Repository the event concerns.
    pub fn repository_id(&self) -> &RepositoryId {
        match self {
            Self::Filtered { repository_id, .. }
            | Self::FormatFailed { repository_id, .. }
            | Self::SettingsUnavailable { repository_id, .. }
            | Self::QueueOverflow { repository_id, .. } => repository_id,
            Self::Completed(outcome) => &outcome.repository_id,
        }
    }

    /// Source event id.
    pub fn event_id(&self) -> EventId {
        match self {
            Self::Filtered { event_id, .. }
            | Self::FormatFailed { event_id, .. }
            | Self::SettingsUnavailable { event_id, .. }
            | Self::QueueOverflow { event_id, .. } => *event_id,
            Self::Completed(outcome) => outcome.event_id,
        }
    }

    /// Terminal lifecycle state this event represents.
    pub fn state(&self) -> NotificationState {
        match self {
            Self::Filtered { .. } => NotificationState::Filtered,
            Self::FormatFailed { .. }
            | Self::SettingsUnavailable { .. }
            | Self::QueueOverflow { .. } => NotificationState::Dropped,
            Self::Completed(outcome) => outcome.status.into(),
        }
    }
}

/// Receives notification lifecycle events.
///
/// Implementations must not block delivery. Failures inside a handler are
/// the handler's concern and are never propagated to the notifier.
#[async_trait::async_trait]
pub trait OutcomeHandler: Send + Sync + std::fmt::Debug {
    /// Handles one lifecycle event.
    async fn handle(&self, event: NotificationEvent);
}

/// Handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpOutcomeHandler;

#[async_trait::async_trait]
impl OutcomeHandler for NoOpOutcomeHandler {
    async fn handle(&self, _event: NotificationEvent) {}
}

/// Forwards events to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastOutcomeHandler {
    handlers: Vec<Arc<dyn OutcomeHandler>>,
}

impl MulticastOutcomeHandler {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn OutcomeHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl OutcomeHandler for MulticastOutcomeHandler {
    async fn handle(&self, event: NotificationEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle(event).await }
        });
        futures::future::join_all(futures).await;
    }
}
