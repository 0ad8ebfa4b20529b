//! Channel-backed event source.
//!
//! The notifier consumes any `Stream` of repository events. This module
//! provides one fed by an in-process channel, used by the HTTP ingest
//! endpoint and by tests. The publisher assigns sequence numbers in the
//! same critical section as the send, so sequence order always matches
//! stream order.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use chrono::{DateTime, Utc};
use futures::Stream;
use herald_core::{EventPayload, EventType, RepositoryEvent, RepositoryId};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::{DeliveryError, Result};

/// Creates a bounded event channel.
///
/// Publishing waits while `capacity` events are buffered and unconsumed.
pub fn event_channel(capacity: usize) -> (EventPublisher, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let publisher = EventPublisher { tx, sequence: Arc::new(Mutex::new(0)) };
    (publisher, EventStream { rx })
}

/// Sending half of an event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<RepositoryEvent>,
    sequence: Arc<Mutex<u64>>,
}

impl EventPublisher {
    /// Builds an event with the next sequence number and sends it.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` if the stream has been dropped or closed.
    pub async fn publish(
        &self,
        repository_id: RepositoryId,
        event_type: EventType,
        payload: EventPayload,
        occurred_at: DateTime<Utc>,
    ) -> Result<RepositoryEvent> {
        let mut sequence = self.sequence.lock().await;
        let event = RepositoryEvent::new(repository_id, event_type, payload, *sequence + 1, occurred_at);

        self.tx.send(event.clone()).await.map_err(|_| DeliveryError::QueueClosed)?;
        *sequence += 1;

        debug!(
            repository = %event.repository_id,
            event_id = %event.id,
            sequence = event.sequence,
            "event published"
        );
        Ok(event)
    }

    /// Publishes an event stamped with the current time.
    ///
    /// # Errors
    ///
    /// See [`EventPublisher::publish`].
    pub async fn publish_now(
        &self,
        repository_id: RepositoryId,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<RepositoryEvent> {
        self.publish(repository_id, event_type, payload, Utc::now()).await
    }

    /// Whether the consuming side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of an event channel.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<RepositoryEvent>,
}

impl EventStream {
    /// Stops accepting new events. Buffered events are still yielded.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl Stream for EventStream {
    type Item = RepositoryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
