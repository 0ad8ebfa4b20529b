//! Bounded per-repository FIFO queues.
//!
//! Each repository gets its own queue so a slow or failing webhook only
//! delays that repository's notifications. Within a queue messages leave in
//! arrival order. The queue also records whether a worker currently owns
//! the repository: `enqueue` reports when a worker must be started, and
//! `pop_or_release` hands ownership back atomically with observing an
//! empty queue, so a message can never sit in a queue without a worker.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use herald_core::{OutboundMessage, RepositoryId};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Default per-repository capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// What `enqueue` does when a repository's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until the worker frees a slot.
    Block,
    /// Evict the oldest queued message and accept the new one.
    DropOldest,
    /// Refuse the new message with `QueueFull`.
    #[default]
    RejectNewest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::DropOldest => write!(f, "drop_oldest"),
            Self::RejectNewest => write!(f, "reject_newest"),
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "block" => Ok(Self::Block),
            "drop_oldest" => Ok(Self::DropOldest),
            "reject_newest" | "reject" => Ok(Self::RejectNewest),
            other => Err(DeliveryError::configuration(format!("unknown overflow policy: {other}"))),
        }
    }
}

/// Queue sizing and overflow behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Messages held per repository.
    pub capacity: usize,
    /// Behaviour at capacity.
    pub overflow_policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: DEFAULT_QUEUE_CAPACITY, overflow_policy: OverflowPolicy::default() }
    }
}

/// Result of a successful enqueue.
#[derive(Debug)]
pub struct EnqueueReceipt {
    /// The repository had no worker; the caller must start one.
    pub spawn_worker: bool,
    /// Message evicted under `DropOldest`.
    pub evicted: Option<OutboundMessage>,
}

#[derive(Debug, Default)]
struct RepositoryQueue {
    messages: VecDeque<OutboundMessage>,
    worker_active: bool,
}

/// Per-repository bounded queues.
#[derive(Debug)]
pub struct DeliveryQueue {
    config: QueueConfig,
    queues: Mutex<HashMap<RepositoryId, RepositoryQueue>>,
    space_available: Notify,
    closed: AtomicBool,
}

impl DeliveryQueue {
    /// Creates an empty queue set.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(HashMap::new()),
            space_available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> QueueConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RepositoryId, RepositoryQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a message to its repository's queue.
    ///
    /// # Errors
    ///
    /// - `QueueFull` under `RejectNewest` when the queue is at capacity
    /// - `QueueClosed` once `close` has been called, including while blocked
    pub async fn enqueue(&self, message: OutboundMessage) -> Result<EnqueueReceipt> {
        loop {
            let space = self.space_available.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                if self.closed.load(Ordering::Acquire) {
                    return Err(DeliveryError::QueueClosed);
                }

                let mut queues = self.lock();
                let queue = queues.entry(message.repository_id.clone()).or_default();

                if queue.messages.len() < self.config.capacity {
                    return Ok(Self::push(queue, message, None));
                }

                match self.config.overflow_policy {
                    OverflowPolicy::RejectNewest => {
                        warn!(
                            repository = %message.repository_id,
                            message_id = %message.id,
                            capacity = self.config.capacity,
                            "queue full, rejecting message"
                        );
                        return Err(DeliveryError::queue_full(&message.repository_id));
                    },
                    OverflowPolicy::DropOldest => {
                        let evicted = queue.messages.pop_front();
                        if let Some(old) = &evicted {
                            warn!(
                                repository = %message.repository_id,
                                evicted_message_id = %old.id,
                                "queue full, evicting oldest message"
                            );
                        }
                        return Ok(Self::push(queue, message, evicted));
                    },
                    OverflowPolicy::Block => {
                        debug!(repository = %message.repository_id, "queue full, waiting for space");
                    },
                }
            }

            space.await;
        }
    }

    fn push(
        queue: &mut RepositoryQueue,
        message: OutboundMessage,
        evicted: Option<OutboundMessage>,
    ) -> EnqueueReceipt {
        queue.messages.push_back(message);
        let spawn_worker = !queue.worker_active;
        queue.worker_active = true;
        EnqueueReceipt { spawn_worker, evicted }
    }

    /// Takes the next message for a repository.
    ///
    /// Returns `None` when the queue is empty and, in the same critical
    /// section, marks the repository as having no worker. The caller must
    /// then stop working on the repository.
    pub fn pop_or_release(&self, repository: &RepositoryId) -> Option<OutboundMessage> {
        let mut queues = self.lock();
        let Some(queue) = queues.get_mut(repository) else {
            return None;
        };

        match queue.messages.pop_front() {
            Some(message) => {
                drop(queues);
                self.space_available.notify_waiters();
                Some(message)
            },
            None => {
                queues.remove(repository);
                None
            },
        }
    }

    /// Gives up worker ownership without draining, e.g. on shutdown or
    /// after a worker panic. Queued messages stay queued.
    pub fn release_worker(&self, repository: &RepositoryId) {
        let mut queues = self.lock();
        if let Some(queue) = queues.get_mut(repository) {
            queue.worker_active = false;
            if queue.messages.is_empty() {
                queues.remove(repository);
            }
        }
    }

    /// Removes and returns every queued message, oldest first within each
    /// repository. Worker ownership is left as it is.
    pub fn drain_all(&self) -> Vec<OutboundMessage> {
        let drained = self
            .lock()
            .values_mut()
            .flat_map(|queue| queue.messages.drain(..))
            .collect();
        self.space_available.notify_waiters();
        drained
    }

    /// Messages queued for one repository.
    pub fn len(&self, repository: &RepositoryId) -> usize {
        self.lock().get(repository).map_or(0, |queue| queue.messages.len())
    }

    /// Messages queued across all repositories.
    pub fn total_len(&self) -> usize {
        self.lock().values().map(|queue| queue.messages.len()).sum()
    }

    /// Whether no message is queued anywhere.
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Stops accepting messages and wakes blocked producers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space_available.notify_waiters();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;
    use herald_core::{EventId, EventType, MessageId, SlackMessage};

    use super::*;

    fn repo(slug: &str) -> RepositoryId {
        RepositoryId::new("PROJ", slug).unwrap()
    }

    fn message(slug: &str, text: &str) -> OutboundMessage {
        let event_id = EventId::new();
        OutboundMessage {
            id: MessageId::for_event(event_id),
            event_id,
            repository_id: repo(slug),
            event_type: EventType::Push,
            target_url: "https://hooks.example/abc".into(),
            body: SlackMessage { text: text.into(), attachments: Vec::new() },
            attempt_count: 0,
            created_at: Utc::now(),
        }
    }

    fn queue(capacity: usize, overflow_policy: OverflowPolicy) -> DeliveryQueue {
        DeliveryQueue::new(QueueConfig { capacity, overflow_policy })
    }

    #[tokio::test]
    async fn first_enqueue_requests_worker() {
        let queue = queue(10, OverflowPolicy::RejectNewest);

        assert!(queue.enqueue(message("a", "1")).await.unwrap().spawn_worker);
        assert!(!queue.enqueue(message("a", "2")).await.unwrap().spawn_worker);
        assert!(queue.enqueue(message("b", "1")).await.unwrap().spawn_worker);
    }

    #[tokio::test]
    async fn messages_leave_in_arrival_order() {
        let queue = queue(10, OverflowPolicy::RejectNewest);
        for text in ["1", "2", "3"] {
            queue.enqueue(message("a", text)).await.unwrap();
        }

        let order: Vec<_> =
            std::iter::from_fn(|| queue.pop_or_release(&repo("a"))).map(|m| m.body.text).collect();
        assert_eq!(order, ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn empty_pop_releases_worker() {
        let queue = queue(10, OverflowPolicy::RejectNewest);
        queue.enqueue(message("a", "1")).await.unwrap();

        assert!(queue.pop_or_release(&repo("a")).is_some());
        assert!(queue.pop_or_release(&repo("a")).is_none());
        assert!(queue.is_empty());
        assert!(queue.enqueue(message("a", "2")).await.unwrap().spawn_worker);
    }

    #[tokio::test]
    async fn reject_newest_refuses_when_full() {
        let queue = queue(2, OverflowPolicy::RejectNewest);
        queue.enqueue(message("a", "1")).await.unwrap();
        queue.enqueue(message("a", "2")).await.unwrap();

        let err = queue.enqueue(message("a", "3")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::QueueFull { .. }));
        assert_eq!(queue.len(&repo("a")), 2);
        assert!(queue.enqueue(message("b", "1")).await.is_ok(), "other repositories unaffected");
    }

    #[tokio::test]
    async fn drop_oldest_evicts_head() {
        let queue = queue(2, OverflowPolicy::DropOldest);
        queue.enqueue(message("a", "1")).await.unwrap();
        queue.enqueue(message("a", "2")).await.unwrap();

        let receipt = queue.enqueue(message("a", "3")).await.unwrap();
        assert_eq!(receipt.evicted.unwrap().body.text, "1");

        let remaining: Vec<_> =
            std::iter::from_fn(|| queue.pop_or_release(&repo("a"))).map(|m| m.body.text).collect();
        assert_eq!(remaining, ["2", "3"]);
    }

    #[tokio::test]
    async fn block_waits_for_space() {
        let queue = Arc::new(queue(1, OverflowPolicy::Block));
        queue.enqueue(message("a", "1")).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(message("a", "2")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop_or_release(&repo("a")).unwrap().body.text, "1");
        let receipt = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should unblock")
            .unwrap()
            .unwrap();
        assert!(!receipt.spawn_worker);
        assert_eq!(queue.len(&repo("a")), 1);
    }

    #[tokio::test]
    async fn close_wakes_blocked_producers() {
        let queue = Arc::new(queue(1, OverflowPolicy::Block));
        queue.enqueue(message("a", "1")).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(message("a", "2")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
        assert!(matches!(result, Err(DeliveryError::QueueClosed)));
    }

    #[tokio::test]
    async fn drain_all_empties_every_repository() {
        let queue = queue(10, OverflowPolicy::RejectNewest);
        queue.enqueue(message("a", "1")).await.unwrap();
        queue.enqueue(message("a", "2")).await.unwrap();
        queue.enqueue(message("b", "1")).await.unwrap();

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 3);
        let a: Vec<_> = drained
            .iter()
            .filter(|m| m.repository_id == repo("a"))
            .map(|m| m.body.text.as_str())
            .collect();
        assert_eq!(a, ["1", "2"]);
        assert!(queue.is_empty());
        assert!(!queue.enqueue(message("a", "3")).await.unwrap().spawn_worker, "worker still owns a");
    }

    #[test]
    fn overflow_policy_parses() {
        assert_eq!("drop-oldest".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::DropOldest);
        assert_eq!("BLOCK".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Block);
        assert!("sometimes".parse::<OverflowPolicy>().is_err());
    }
}
