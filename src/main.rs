//! Herald repository notification service.
//!
//! Main entry point. Loads configuration, opens the settings database,
//! starts the notifier and the HTTP API, and coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_api::{router_with_timeout, shutdown_signal, start_server, AppState, Config};
use herald_core::{storage::Storage, Clock, RealClock, SettingsStore};
use herald_delivery::{event_channel, Notifier};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!("starting herald notification service");
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        worker_pool_size = config.worker_pool_size,
        queue_capacity = config.queue_capacity,
        overflow_policy = %config.queue_overflow_policy,
        "configuration loaded"
    );

    let storage = Storage::connect(&config.database_url, config.database_max_connections)
        .await
        .context("failed to open settings database")?;
    storage.migrate().await.context("failed to prepare settings schema")?;
    info!("settings database ready");

    let settings: Arc<dyn SettingsStore> = storage.slack_settings.clone();
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let notifier =
        Notifier::with_clock(config.to_notifier_config(), settings.clone(), clock.clone())
            .context("failed to start notifier")?;

    let (publisher, events) = event_channel(config.event_buffer_size);
    let intake = tokio::spawn({
        let notifier = notifier.clone();
        async move { notifier.run(events).await }
    });

    let state = AppState::new(settings, publisher, notifier.clone(), clock);
    let router = router_with_timeout(state, Duration::from_secs(config.request_timeout));
    let addr = config.parse_server_addr()?;

    info!(%addr, "herald is ready to receive events");

    if let Err(e) = start_server(router, addr, shutdown_signal()).await {
        error!(error = %e, "HTTP server failed");
    }

    match notifier.shutdown().await {
        Ok(()) => info!("notifier drained"),
        Err(e) => warn!(error = %e, "notifier did not drain before the deadline"),
    }
    if let Err(e) = intake.await {
        warn!(error = %e, "event intake task ended abnormally");
    }

    storage.pool().close().await;
    info!("database connections closed");

    let stats = notifier.stats();
    info!(
        delivered = stats.delivered,
        dropped = stats.dropped + stats.dropped_permanent,
        filtered = stats.filtered,
        "herald shutdown complete"
    );
    Ok(())
}

/// Initializes tracing with the configured filter.
fn init_tracing(directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives)
        .with_context(|| format!("invalid log filter: {directives}"))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}
