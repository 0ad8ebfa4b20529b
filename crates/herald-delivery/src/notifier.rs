//! Notifier core: filters, formats, queues and delivers repository events.
//!
//! Every event is checked against the repository's current settings, read
//! fresh from the [`SettingsStore`] with no caching. Events that pass are
//! rendered and appended to the repository's queue. One worker task per
//! repository drains that queue in order. Settings are read again before
//! each dispatch, so a repository disabled while messages are queued stops
//! sending immediately.
//!
//! # Lifecycle
//!
//! ```text
//! Received ─┬─▶ Filtered
//!           └─▶ Formatted ─▶ Enqueued ─▶ Delivering ─┬─▶ Delivered
//!                                                    ├─▶ Dropped
//!                                                    └─▶ DroppedPermanent
//! ```
//!
//! Every terminal step is logged, counted and reported to the configured
//! [`OutcomeHandler`]. Failures never stop the intake loop and never cross
//! from one repository into another.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{Stream, StreamExt};
use herald_core::{
    Clock, DeliveryOutcome, DeliveryStatus, MessageId, NoOpOutcomeHandler, NotificationEvent,
    NotificationFormatter, OutcomeHandler, RealClock, Rendered, RepositoryEvent, RepositoryId,
    SettingsStore, SuppressReason,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    circuit::{CircuitBreakerManager, CircuitConfig},
    client::{ClientConfig, WebhookClient},
    dispatcher::WebhookDispatcher,
    error::{DeliveryError, Result},
    queue::{DeliveryQueue, QueueConfig},
    retry::RetryPolicy,
    worker_pool::WorkerPool,
};

/// Notifier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Maximum concurrent deliveries across all repositories.
    pub worker_count: usize,
    /// Per-repository queue settings.
    pub queue: QueueConfig,
    /// HTTP client settings.
    pub client: ClientConfig,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
    /// Per-target circuit breaker settings.
    pub circuit: CircuitConfig,
    /// How long `shutdown` waits for in-flight deliveries.
    pub shutdown_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            queue: QueueConfig::default(),
            client: ClientConfig::default(),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            shutdown_timeout: Duration::from_secs(crate::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        }
    }
}

impl NotifierConfig {
    /// Rejects configurations the notifier cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.queue.capacity == 0 {
            return Err(DeliveryError::configuration("queue capacity must be at least 1"));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(DeliveryError::configuration("circuit failure_threshold must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(DeliveryError::configuration("retry jitter_factor must be within 0.0..=1.0"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(DeliveryError::configuration(
                "retry max_delay must not be shorter than base_delay",
            ));
        }
        Ok(())
    }
}

/// What `process_event` did with an event.
#[derive(Debug, Clone)]
pub enum EventDisposition {
    /// Settings suppressed the event.
    Filtered(SuppressReason),
    /// A message was queued for delivery.
    Enqueued {
        /// Queued message.
        message_id: MessageId,
    },
    /// The queue refused the message.
    Rejected(DeliveryError),
    /// The event could not be turned into a message.
    Dropped {
        /// Why, for logs and callers.
        reason: String,
    },
}

impl EventDisposition {
    /// Whether a message was queued.
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }

    /// Whether settings suppressed the event.
    pub fn is_filtered(&self) -> bool {
        matches!(self, Self::Filtered(_))
    }
}

/// Snapshot of notifier counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierStats {
    /// Events handed to `process_event`.
    pub received: u64,
    /// Events or queued messages suppressed by settings.
    pub filtered: u64,
    /// Messages accepted by a queue.
    pub enqueued: u64,
    /// Messages the webhook accepted.
    pub delivered: u64,
    /// Messages that exhausted retries or were cut short by shutdown.
    pub dropped: u64,
    /// Messages the webhook rejected outright.
    pub dropped_permanent: u64,
    /// Messages skipped because the target's circuit was open.
    pub circuit_rejected: u64,
    /// Events the formatter could not render.
    pub format_failures: u64,
    /// Events dropped because settings could not be read.
    pub settings_failures: u64,
    /// Messages refused by a full or closed queue.
    pub queue_rejected: u64,
    /// Queued messages evicted to make room.
    pub queue_evicted: u64,
    /// Repository worker tasks alive.
    pub active_workers: usize,
    /// Deliveries currently holding a slot.
    pub in_flight: usize,
    /// Messages waiting in queues.
    pub queued: usize,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    filtered: AtomicU64,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    dropped_permanent: AtomicU64,
    circuit_rejected: AtomicU64,
    format_failures: AtomicU64,
    settings_failures: AtomicU64,
    queue_rejected: AtomicU64,
    queue_evicted: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug)]
struct NotifierInner {
    config: NotifierConfig,
    settings: Arc<dyn SettingsStore>,
    formatter: NotificationFormatter,
    queue: DeliveryQueue,
    dispatcher: WebhookDispatcher,
    pool: WorkerPool,
    handler: Arc<dyn OutcomeHandler>,
    counters: Counters,
    clock: Arc<dyn Clock>,
    cancellation: CancellationToken,
}

/// Per-repository ordered webhook notifier.
///
/// Cheap to clone; clones share queues, workers and counters.
#[derive(Debug, Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

impl Notifier {
    /// Creates a notifier with the real clock and no outcome subscribers.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for invalid configuration or if the
    /// HTTP client cannot be built.
    pub fn new(config: NotifierConfig, settings: Arc<dyn SettingsStore>) -> Result<Self> {
        Self::with_clock(config, settings, Arc::new(RealClock::new()))
    }

    /// Creates a notifier with an injected clock.
    ///
    /// # Errors
    ///
    /// See [`Notifier::new`].
    pub fn with_clock(
        config: NotifierConfig,
        settings: Arc<dyn SettingsStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_outcome_handler(config, settings, clock, Arc::new(NoOpOutcomeHandler))
    }

    /// Creates a notifier reporting lifecycle events to `handler`.
    ///
    /// # Errors
    ///
    /// See [`Notifier::new`].
    pub fn with_outcome_handler(
        config: NotifierConfig,
        settings: Arc<dyn SettingsStore>,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn OutcomeHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let cancellation = CancellationToken::new();
        let client = Arc::new(WebhookClient::new(config.client.clone())?);
        let circuits = CircuitBreakerManager::with_clock(config.circuit.clone(), clock.clone());
        let dispatcher = WebhookDispatcher::new(
            client,
            circuits,
            config.retry.clone(),
            clock.clone(),
            cancellation.clone(),
        );

        info!(
            worker_count = config.worker_count,
            queue_capacity = config.queue.capacity,
            overflow_policy = %config.queue.overflow_policy,
            max_retries = config.retry.max_retries,
            "notifier configured"
        );

        Ok(Self {
            inner: Arc::new(NotifierInner {
                queue: DeliveryQueue::new(config.queue),
                pool: WorkerPool::new(config.worker_count, cancellation.clone()),
                formatter: NotificationFormatter::new(),
                counters: Counters::default(),
                config,
                settings,
                dispatcher,
                handler,
                clock,
                cancellation,
            }),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &NotifierConfig {
        &self.inner.config
    }

    /// Circuit registry, for inspection and operator overrides.
    pub fn circuits(&self) -> &CircuitBreakerManager {
        self.inner.dispatcher.circuits()
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancellation.is_cancelled() || self.inner.queue.is_closed()
    }

    /// Filters, formats and enqueues one event.
    ///
    /// Never fails: every problem is logged, counted, reported to the
    /// outcome handler and summarized in the returned disposition. Under
    /// the `Block` overflow policy this waits for queue space.
    pub async fn process_event(&self, event: RepositoryEvent) -> EventDisposition {
        let span = info_span!(
            "process_event",
            repository = %event.repository_id,
            event_id = %event.id,
            event_type = %event.event_type,
            sequence = event.sequence,
        );
        self.inner.process_event(event).instrument(span).await
    }

    /// Consumes an event stream until it ends or shutdown is requested.
    ///
    /// Events are handed to one intake task per repository, so each
    /// repository's events are processed in stream order while a
    /// repository blocked on a full queue under `Block` only holds back its
    /// own events. Each intake buffers up to the queue capacity; the stream
    /// itself is paused only once a blocked repository's buffer is full.
    /// Returns after every intake task has finished.
    pub async fn run<S>(&self, events: S)
    where
        S: Stream<Item = RepositoryEvent> + Send,
    {
        let mut events = std::pin::pin!(events);
        let mut intakes: HashMap<RepositoryId, mpsc::Sender<RepositoryEvent>> = HashMap::new();
        let mut tasks = JoinSet::new();
        info!("notifier consuming events");

        loop {
            let event = tokio::select! {
                biased;
                () = self.inner.cancellation.cancelled() => {
                    info!("shutdown requested, stopping event intake");
                    break;
                }
                next = events.next() => match next {
                    Some(event) => event,
                    None => {
                        info!("event stream ended");
                        break;
                    },
                },
            };

            let intake = intakes
                .entry(event.repository_id.clone())
                .or_insert_with_key(|repository| self.spawn_intake(&mut tasks, repository));

            tokio::select! {
                biased;
                () = self.inner.cancellation.cancelled() => {
                    info!("shutdown requested, stopping event intake");
                    break;
                }
                sent = intake.send(event) => {
                    if let Err(mpsc::error::SendError(event)) = sent {
                        error!(
                            repository = %event.repository_id,
                            event_id = %event.id,
                            "repository intake gone, event lost"
                        );
                    }
                }
            }
        }

        drop(intakes);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "repository intake task failed");
            }
        }
    }

    fn spawn_intake(
        &self,
        tasks: &mut JoinSet<()>,
        repository: &RepositoryId,
    ) -> mpsc::Sender<RepositoryEvent> {
        let (sender, mut receiver) = mpsc::channel(self.inner.config.queue.capacity);
        let notifier = self.clone();
        let span = info_span!("repository_intake", repository = %repository);
        tasks.spawn(
            async move {
                while let Some(event) = receiver.recv().await {
                    notifier.process_event(event).await;
                }
            }
            .instrument(span),
        );
        sender
    }

    /// Resolves once every queue is drained and no worker is running.
    ///
    /// After shutdown, messages left in closed queues do not hold this up.
    pub async fn wait_idle(&self) {
        let inner = &self.inner;
        loop {
            let notified = inner.pool.idle_notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if inner.pool.active_workers() == 0
                && (inner.queue.is_empty() || inner.queue.is_closed())
            {
                return;
            }
            notified.await;
        }
    }

    /// Current counters.
    pub fn stats(&self) -> NotifierStats {
        let c = &self.inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        NotifierStats {
            received: load(&c.received),
            filtered: load(&c.filtered),
            enqueued: load(&c.enqueued),
            delivered: load(&c.delivered),
            dropped: load(&c.dropped),
            dropped_permanent: load(&c.dropped_permanent),
            circuit_rejected: load(&c.circuit_rejected),
            format_failures: load(&c.format_failures),
            settings_failures: load(&c.settings_failures),
            queue_rejected: load(&c.queue_rejected),
            queue_evicted: load(&c.queue_evicted),
            active_workers: self.inner.pool.active_workers(),
            in_flight: self.inner.pool.in_flight(),
            queued: self.inner.queue.total_len(),
        }
    }

    /// Stops accepting events and waits for in-flight deliveries.
    ///
    /// Workers finish the message they are dispatching and backoff waits end
    /// early. Queued messages that were never started are discarded, each
    /// reported to the outcome handler as `Dropped`.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers outlive `shutdown_timeout`.
    pub async fn shutdown(&self) -> Result<()> {
        info!(
            queued = self.inner.queue.total_len(),
            active_workers = self.inner.pool.active_workers(),
            "shutting down notifier"
        );

        self.inner.queue.close();
        let result = self.inner.pool.shutdown_graceful(self.inner.config.shutdown_timeout).await;

        let discarded = self.inner.queue.drain_all();
        if !discarded.is_empty() {
            warn!(discarded = discarded.len(), "undelivered messages discarded at shutdown");
        }
        for message in discarded {
            bump(&self.inner.counters.dropped);
            let outcome = DeliveryOutcome {
                message_id: message.id,
                event_id: message.event_id,
                repository_id: message.repository_id,
                target_url: message.target_url,
                status: DeliveryStatus::Dropped,
                http_status: None,
                error: Some("discarded at shutdown".to_string()),
                attempts: message.attempt_count,
                completed_at: self.inner.clock.now_utc(),
            };
            self.inner.handler.handle(NotificationEvent::Completed(outcome)).await;
        }
        result
    }
}

impl NotifierInner {
    async fn process_event(self: &Arc<Self>, event: RepositoryEvent) -> EventDisposition {
        bump(&self.counters.received);

        if self.queue.is_closed() {
            bump(&self.counters.queue_rejected);
            debug!("notifier shutting down, event refused");
            return EventDisposition::Rejected(DeliveryError::QueueClosed);
        }

        let settings = match self.settings.get(&event.repository_id).await {
            Ok(settings) => settings,
            Err(e) => {
                bump(&self.counters.settings_failures);
                error!(error = %e, "failed to read settings, dropping event");
                self.handler
                    .handle(NotificationEvent::SettingsUnavailable {
                        event_id: event.id,
                        repository_id: event.repository_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                return EventDisposition::Dropped { reason: e.to_string() };
            },
        };

        let message = match self.formatter.format(&event, &settings) {
            Ok(Rendered::Message(message)) => message,
            Ok(Rendered::Suppressed(reason)) => {
                bump(&self.counters.filtered);
                debug!(reason = %reason, "event filtered by settings");
                self.handler
                    .handle(NotificationEvent::Filtered {
                        event_id: event.id,
                        repository_id: event.repository_id.clone(),
                        event_type: event.event_type,
                        reason,
                        at: self.clock.now_utc(),
                    })
                    .await;
                return EventDisposition::Filtered(reason);
            },
            Err(e) => {
                bump(&self.counters.format_failures);
                error!(error = %e, "failed to format event, dropping");
                self.handler
                    .handle(NotificationEvent::FormatFailed {
                        event_id: event.id,
                        repository_id: event.repository_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                return EventDisposition::Dropped { reason: e.to_string() };
            },
        };

        let message_id = message.id;
        let event_id = message.event_id;
        let repository = message.repository_id.clone();

        match self.queue.enqueue(message).await {
            Ok(receipt) => {
                bump(&self.counters.enqueued);
                debug!(message_id = %message_id, "message enqueued");

                if receipt.spawn_worker {
                    self.spawn_worker(repository.clone());
                }

                if let Some(evicted) = receipt.evicted {
                    bump(&self.counters.queue_evicted);
                    self.handler
                        .handle(NotificationEvent::QueueOverflow {
                            message_id: evicted.id,
                            event_id: evicted.event_id,
                            repository_id: repository,
                            evicted: true,
                        })
                        .await;
                }

                EventDisposition::Enqueued { message_id }
            },
            Err(err) => {
                bump(&self.counters.queue_rejected);
                warn!(error = %err, "message not enqueued");
                if matches!(err, DeliveryError::QueueFull { .. }) {
                    self.handler
                        .handle(NotificationEvent::QueueOverflow {
                            message_id,
                            event_id,
                            repository_id: repository,
                            evicted: false,
                        })
                        .await;
                }
                EventDisposition::Rejected(err)
            },
        }
    }

    fn spawn_worker(self: &Arc<Self>, repository: RepositoryId) {
        let inner = Arc::clone(self);
        let span = info_span!("repository_worker", repository = %repository);
        let task_repository = repository.clone();
        self.pool.spawn(
            repository,
            async move { inner.drain_repository(task_repository).await }.instrument(span),
        );
    }

    /// Delivers a repository's queued messages one at a time, in order,
    /// until the queue is empty or shutdown is requested.
    async fn drain_repository(&self, repository: RepositoryId) {
        let mut lease = WorkerLease { queue: &self.queue, repository: &repository, held: true };

        loop {
            if self.cancellation.is_cancelled() {
                let remaining = self.queue.len(&repository);
                if remaining > 0 {
                    warn!(remaining, "worker stopping with messages still queued");
                }
                return;
            }

            let Some(permit) = self.pool.acquire().await else {
                continue;
            };

            let Some(mut message) = self.queue.pop_or_release(&repository) else {
                lease.held = false;
                return;
            };

            let settings = match self.settings.get(&repository).await {
                Ok(settings) => settings,
                Err(e) => {
                    bump(&self.counters.settings_failures);
                    error!(
                        message_id = %message.id,
                        error = %e,
                        "failed to read settings before dispatch, dropping message"
                    );
                    self.handler
                        .handle(NotificationEvent::SettingsUnavailable {
                            event_id: message.event_id,
                            repository_id: repository.clone(),
                            error: e.to_string(),
                        })
                        .await;
                    continue;
                },
            };

            if let Some(reason) = settings.suppression(message.event_type) {
                bump(&self.counters.filtered);
                debug!(message_id = %message.id, reason = %reason, "queued message filtered by settings");
                self.handler
                    .handle(NotificationEvent::Filtered {
                        event_id: message.event_id,
                        repository_id: repository.clone(),
                        event_type: message.event_type,
                        reason,
                        at: self.clock.now_utc(),
                    })
                    .await;
                continue;
            }

            if let Some(url) = settings.webhook_url() {
                if url != message.target_url {
                    debug!(
                        message_id = %message.id,
                        "webhook url changed while queued, using current url"
                    );
                    message.target_url = url.to_string();
                }
            }

            let outcome = self.dispatcher.deliver(message).await;
            drop(permit);

            match outcome.status {
                DeliveryStatus::Delivered => bump(&self.counters.delivered),
                DeliveryStatus::Dropped => bump(&self.counters.dropped),
                DeliveryStatus::DroppedPermanent => bump(&self.counters.dropped_permanent),
                DeliveryStatus::CircuitOpen => bump(&self.counters.circuit_rejected),
            }
            self.handler.handle(NotificationEvent::Completed(outcome)).await;
        }
    }
}

/// Returns a repository to the unowned state when its worker exits
/// without observing an empty queue, including by panic.
struct WorkerLease<'a> {
    queue: &'a DeliveryQueue,
    repository: &'a RepositoryId,
    held: bool,
}

impl Drop for WorkerLease<'_> {
    fn drop(&mut self) {
        if self.held {
            self.queue.release_worker(self.repository);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use herald_core::{
        ChangeKind, EventPayload, EventType, InMemorySettingsStore, RefChange, SlackSettings,
        TestClock,
    };

    use super::*;

    fn push(repository: &RepositoryId) -> RepositoryEvent {
        RepositoryEvent::new(
            repository.clone(),
            EventType::Push,
            EventPayload {
                actor: "alice".into(),
                ref_changes: vec![RefChange {
                    ref_id: "refs/heads/main".into(),
                    from_hash: "0".repeat(40),
                    to_hash: "a".repeat(40),
                    kind: ChangeKind::Update,
                }],
                ..EventPayload::default()
            },
            1,
            Utc::now(),
        )
    }

    fn notifier(store: Arc<InMemorySettingsStore>) -> Notifier {
        Notifier::with_clock(NotifierConfig::default(), store, Arc::new(TestClock::new())).unwrap()
    }

    #[test]
    fn config_validation_rejects_zero_workers() {
        let config = NotifierConfig { worker_count: 0, ..NotifierConfig::default() };
        assert!(matches!(config.validate(), Err(DeliveryError::ConfigurationError { .. })));
        assert!(NotifierConfig::default().validate().is_ok());
    }

    #[test]
    fn config_validation_rejects_inverted_delays() {
        let mut config = NotifierConfig::default();
        config.retry.max_delay = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn unconfigured_repository_is_filtered() {
        let store = Arc::new(InMemorySettingsStore::new());
        let notifier = notifier(store);
        let repository = RepositoryId::new("PROJ", "repo").unwrap();

        let disposition = notifier.process_event(push(&repository)).await;

        assert!(matches!(
            disposition,
            EventDisposition::Filtered(SuppressReason::NotificationsDisabled)
        ));
        let stats = notifier.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.enqueued, 0);
    }

    #[tokio::test]
    async fn events_refused_after_shutdown() {
        let store = Arc::new(InMemorySettingsStore::new());
        let repository = RepositoryId::new("PROJ", "repo").unwrap();
        store
            .put(
                &repository,
                SlackSettings::new(true, true, Some("http://127.0.0.1:1/hook".into())).unwrap(),
            )
            .await
            .unwrap();
        let notifier = notifier(store);

        notifier.shutdown().await.unwrap();
        assert!(notifier.is_shutting_down());

        let disposition = notifier.process_event(push(&repository)).await;
        assert!(matches!(disposition, EventDisposition::Rejected(DeliveryError::QueueClosed)));
        assert_eq!(notifier.stats().queue_rejected, 1);
    }
}
