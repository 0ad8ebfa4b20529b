//! Ordered, at-least-once webhook delivery for repository notifications.
//!
//! This crate turns repository events into chat webhook posts. Events are
//! filtered against per-repository settings, rendered, and appended to a
//! bounded queue owned by that repository. A worker per repository drains
//! its queue strictly in order while a shared semaphore bounds how many
//! deliveries run at once across all repositories.
//!
//! # Architecture
//!
//! 1. **Intake** - [`Notifier::process_event`] reads settings, formats and
//!    enqueues
//! 2. **Queueing** - [`DeliveryQueue`] keeps one FIFO per repository and
//!    applies the overflow policy
//! 3. **Dispatch** - [`WebhookDispatcher`] posts with retries, backoff and a
//!    per-URL circuit breaker
//! 4. **Reporting** - outcomes go to logs, counters and an
//!    [`OutcomeHandler`](herald_core::OutcomeHandler)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::InMemorySettingsStore;
//! use herald_delivery::{event_channel, Notifier, NotifierConfig};
//!
//! # async fn example() -> herald_delivery::Result<()> {
//! let notifier = Notifier::new(NotifierConfig::default(), Arc::new(InMemorySettingsStore::new()))?;
//! let (publisher, events) = event_channel(1024);
//!
//! let runner = notifier.clone();
//! tokio::spawn(async move { runner.run(events).await });
//!
//! // publisher.publish(...) feeds the notifier
//! # drop(publisher);
//! notifier.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod notifier;
pub mod queue;
pub mod retry;
pub mod source;
pub mod worker_pool;

pub use circuit::{CircuitBreakerManager, CircuitConfig, CircuitState};
pub use client::{ClientConfig, WebhookClient};
pub use dispatcher::WebhookDispatcher;
pub use error::{DeliveryError, ErrorCategory, Result};
pub use notifier::{EventDisposition, Notifier, NotifierConfig, NotifierStats};
pub use queue::{DeliveryQueue, OverflowPolicy, QueueConfig};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use source::{event_channel, EventPublisher, EventStream};

/// Default number of concurrent deliveries.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 5;

/// Default time allowed for in-flight deliveries at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;
