//! Herald HTTP API and service configuration.
//!
//! Exposes the administrative settings endpoints, the event ingest
//! endpoint feeding the notifier, and health probes. Configuration is
//! layered with figment and converted into notifier settings here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use herald_core::{Clock, SettingsStore};
use herald_delivery::{EventPublisher, Notifier};

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, router_with_timeout, shutdown_signal, start_server};

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Per-repository Slack settings.
    pub settings: Arc<dyn SettingsStore>,
    /// Sending half of the notifier's event feed.
    pub publisher: EventPublisher,
    /// Running notifier, for health and shutdown state.
    pub notifier: Notifier,
    /// Clock for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Bundles the handler dependencies.
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        publisher: EventPublisher,
        notifier: Notifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { settings, publisher, notifier, clock }
    }
}
