//! Test infrastructure shared by herald integration tests.
//!
//! Bundles a mock webhook server, a virtual clock, an in-memory settings
//! store and a recording outcome handler into one [`TestEnv`], so a test
//! can configure a repository, push events through a real [`Notifier`] and
//! assert on what reached the wire.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use herald_core::{Clock, InMemorySettingsStore, RepositoryId, SettingsStore, SlackSettings};
use herald_delivery::{ClientConfig, Notifier, NotifierConfig, RetryPolicy};

pub mod events;
pub mod fixtures;
pub mod http;

pub use events::{RecordingHandler, DEFAULT_EVENT_TIMEOUT};
pub use fixtures::{enabled_settings, fixed_time, push_muted_settings, repository, EventBuilder};
pub use herald_core::TestClock;
pub use http::MockWebhook;

/// Everything a notifier integration test needs.
pub struct TestEnv {
    /// Mock chat service.
    pub webhook: MockWebhook,
    /// Virtual clock; backoff sleeps advance it instantly.
    pub clock: Arc<TestClock>,
    /// Settings store shared with notifiers built from this env.
    pub settings: Arc<InMemorySettingsStore>,
    /// Records every lifecycle event the notifier reports.
    pub recorder: Arc<RecordingHandler>,
}

impl TestEnv {
    /// Starts a mock webhook and fresh in-memory state.
    pub async fn new() -> Self {
        Self {
            webhook: MockWebhook::start().await,
            clock: Arc::new(TestClock::new()),
            settings: Arc::new(InMemorySettingsStore::new()),
            recorder: Arc::new(RecordingHandler::new()),
        }
    }

    /// Notifier configuration suited to tests: no jitter and a short HTTP
    /// timeout.
    pub fn config() -> NotifierConfig {
        NotifierConfig {
            client: ClientConfig { timeout: Duration::from_secs(2), ..ClientConfig::default() },
            retry: RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
            shutdown_timeout: Duration::from_secs(5),
            ..NotifierConfig::default()
        }
    }

    /// Builds a notifier wired to this environment's store, clock and
    /// recorder.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid.
    pub fn notifier(&self, config: NotifierConfig) -> Notifier {
        let clock: Arc<dyn Clock> = self.clock.clone();
        Notifier::with_outcome_handler(config, self.settings.clone(), clock, self.recorder.clone())
            .expect("test notifier config must be valid")
    }

    /// Stores settings for a repository.
    ///
    /// # Panics
    ///
    /// Panics if the store rejects the settings.
    pub async fn configure(&self, repository: &RepositoryId, settings: SlackSettings) {
        self.settings.put(repository, settings).await.expect("settings accepted");
    }

    /// Enables every notification for a repository, posting to the named
    /// mock hook.
    pub async fn enable(&self, repository: &RepositoryId, hook: &str) {
        self.configure(repository, enabled_settings(self.webhook.hook_url(hook))).await;
    }
}
