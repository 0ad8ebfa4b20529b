//! Health check handlers for service monitoring.
//!
//! `/health` checks the settings store and reports notifier counters;
//! `/live` only proves the process answers HTTP.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use herald_core::{Clock, SettingsStore};
use herald_delivery::{Notifier, NotifierStats};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Notifier counters at the time of the check
    pub notifier: NotifierStats,
    /// Service version information
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Serving, but no longer accepting events
    Degraded,
    /// Critical systems failing
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Settings store reachability
    pub settings_store: ComponentHealth,
    /// Whether the notifier accepts events
    pub notifier: ComponentHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Runs health checks against an injected clock.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks the store and the notifier.
    pub async fn health_check(
        &self,
        settings: &dyn SettingsStore,
        notifier: &Notifier,
    ) -> HealthResponse {
        debug!("performing health check");

        let timestamp = self.clock.now_utc();
        let store = self.check_settings_store(settings).await;
        let intake = if notifier.is_shutting_down() {
            ComponentHealth {
                status: ComponentStatus::Down,
                message: Some("notifier is shutting down".to_string()),
                response_time_ms: 0,
            }
        } else {
            ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms: 0 }
        };

        let status = match (store.status, intake.status) {
            (ComponentStatus::Down, _) => HealthStatus::Unhealthy,
            (ComponentStatus::Up, ComponentStatus::Down) => HealthStatus::Degraded,
            (ComponentStatus::Up, ComponentStatus::Up) => HealthStatus::Healthy,
        };

        HealthResponse {
            status,
            timestamp,
            checks: HealthChecks { settings_store: store, notifier: intake },
            notifier: notifier.stats(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn check_settings_store(&self, settings: &dyn SettingsStore) -> ComponentHealth {
        let start = self.clock.now();
        let result = settings.health_check().await;
        let elapsed = self.clock.now().saturating_duration_since(start);
        let response_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => {
                debug!("settings store health check passed");
                ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms }
            },
            Err(e) => {
                error!(error = %e, "settings store health check failed");
                ComponentHealth {
                    status: ComponentStatus::Down,
                    message: Some(format!("settings store unavailable: {e}")),
                    response_time_ms,
                }
            },
        }
    }
}

/// Health check endpoint handler.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let service = HealthService::new(state.clock.clone());
    let response = service.health_check(state.settings.as_ref(), &state.notifier).await;

    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(
        status = ?response.status,
        store_status = ?response.checks.settings_store.status,
        "health check completed"
    );

    (status_code, Json(response)).into_response()
}

/// Liveness check endpoint for orchestrator probes.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "herald"
    });

    (StatusCode::OK, Json(response)).into_response()
}
