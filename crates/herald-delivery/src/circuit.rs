//! Per-target circuit breaker.
//!
//! Circuits are keyed by webhook URL and count permanent delivery failures,
//! not individual HTTP attempts: a message the webhook refuses with a 4xx
//! counts once. Messages dropped after exhausting retries on transient
//! errors are not counted. After `failure_threshold` consecutive permanent
//! failures the circuit opens and deliveries to that URL fail fast until
//! the cool-down elapses.
//!
//! # State machine
//!
//! ```text
//!                          ┌─────────────────────────┐
//!                          │        CLOSED           │
//!                          │ ● deliveries allowed    │
//!                          │ ● counting failures     │
//!                          └─────────────────────────┘
//!                           │                        ▲
//!        M consecutive      │                        │ probe delivered
//!       permanent failures  │                        │
//!                           ▼                        │
//!    ┌─────────────────────────┐                  ┌───────────────────────┐
//!    │         OPEN            │   cool-down      │       HALF-OPEN       │
//!    │ ● fail fast, no HTTP    │ ───────────────▶ │ ● one probe delivery  │
//!    └─────────────────────────┘                  └───────────────────────┘
//!                 ▲                                           │
//!                 └──────────────── probe failed ─────────────┘
//! ```
//!
//! Time comes from the injected [`Clock`], so cool-downs are testable
//! without real waiting.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use herald_core::{Clock, RealClock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{DeliveryError, Result};

/// Circuit breaker configuration shared by every target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive permanent failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects deliveries.
    pub cooldown: Duration,
    /// Concurrent probe deliveries allowed while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(60), half_open_max_probes: 1 }
    }
}

/// Current state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Deliveries allowed.
    Closed,
    /// Deliveries rejected until the cool-down elapses.
    Open,
    /// Probe deliveries allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// State and counters for one target.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state.
    pub state: CircuitState,
    /// Terminal failures since the last success.
    pub consecutive_failures: u32,
    /// Successful deliveries recorded.
    pub total_successes: u64,
    /// Terminal failures recorded.
    pub total_failures: u64,
    /// Deliveries rejected while open.
    pub rejected: u64,
    /// When the circuit last opened.
    pub opened_at: Option<Instant>,
    /// Probes currently in flight while half-open.
    pub probes_in_flight: u32,
}

impl CircuitStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            rejected: 0,
            opened_at: None,
            probes_in_flight: 0,
        }
    }
}

/// Thread-safe registry of circuits keyed by webhook URL.
#[derive(Debug, Clone)]
pub struct CircuitBreakerManager {
    config: CircuitConfig,
    circuits: Arc<Mutex<HashMap<String, CircuitStats>>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerManager {
    /// Creates a manager using the real clock.
    pub fn new(config: CircuitConfig) -> Self {
        Self::with_clock(config, Arc::new(RealClock::new()))
    }

    /// Creates a manager with an injected clock.
    pub fn with_clock(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, circuits: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    /// Configuration in use.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Admits or rejects a delivery to `target`.
    ///
    /// Moves an open circuit to half-open once the cool-down has elapsed and
    /// reserves a probe slot for the caller. Every admitted delivery must be
    /// followed by `record_success`, `record_failure` or `record_abandoned`.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn try_acquire(&self, target: &str) -> Result<()> {
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(target.to_string()).or_insert_with(CircuitStats::new);

        if stats.state == CircuitState::Open {
            let cooled_down = stats
                .opened_at
                .is_some_and(|opened| self.clock.now().duration_since(opened) >= self.config.cooldown);
            if cooled_down {
                info!(target_url = target, "circuit half-open, allowing probe");
                stats.state = CircuitState::HalfOpen;
                stats.probes_in_flight = 0;
            }
        }

        match stats.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if stats.probes_in_flight < self.config.half_open_max_probes => {
                stats.probes_in_flight += 1;
                Ok(())
            },
            CircuitState::Open | CircuitState::HalfOpen => {
                stats.rejected += 1;
                Err(DeliveryError::circuit_open(target))
            },
        }
    }

    /// Records a delivered message.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn record_success(&self, target: &str) {
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(target.to_string()).or_insert_with(CircuitStats::new);

        stats.total_successes += 1;
        stats.consecutive_failures = 0;

        if stats.state == CircuitState::HalfOpen {
            info!(target_url = target, "circuit closed, target recovered");
            stats.state = CircuitState::Closed;
            stats.opened_at = None;
            stats.probes_in_flight = 0;
        }
    }

    /// Records a permanent delivery failure.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn record_failure(&self, target: &str) {
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(target.to_string()).or_insert_with(CircuitStats::new);

        stats.total_failures += 1;
        stats.consecutive_failures += 1;

        let should_open = match stats.state {
            CircuitState::Closed => stats.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            warn!(
                target_url = target,
                consecutive_failures = stats.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit opened"
            );
            stats.state = CircuitState::Open;
            stats.opened_at = Some(self.clock.now());
            stats.probes_in_flight = 0;
        }
    }

    /// Releases an admitted delivery that ended without an outcome, such as
    /// one interrupted by shutdown.
    pub async fn record_abandoned(&self, target: &str) {
        let mut circuits = self.circuits.lock().await;
        if let Some(stats) = circuits.get_mut(target) {
            stats.probes_in_flight = stats.probes_in_flight.saturating_sub(1);
        }
    }

    /// Current statistics for a target.
    pub async fn circuit_stats(&self, target: &str) -> Option<CircuitStats> {
        self.circuits.lock().await.get(target).cloned()
    }

    /// Current state for a target, closed if never seen.
    pub async fn state(&self, target: &str) -> CircuitState {
        self.circuit_stats(target).await.map_or(CircuitState::Closed, |stats| stats.state)
    }

    /// Number of circuits currently open.
    pub async fn open_circuits(&self) -> usize {
        self.circuits.lock().await.values().filter(|s| s.state == CircuitState::Open).count()
    }

    /// Forces a circuit into a state. Intended for operators and tests.
    pub async fn force_circuit_state(&self, target: &str, state: CircuitState) {
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(target.to_string()).or_insert_with(CircuitStats::new);

        stats.state = state;
        stats.probes_in_flight = 0;
        match state {
            CircuitState::Open => stats.opened_at = Some(self.clock.now()),
            CircuitState::Closed => {
                stats.opened_at = None;
                stats.consecutive_failures = 0;
            },
            CircuitState::HalfOpen => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use herald_core::TestClock;

    use super::*;

    const TARGET: &str = "https://hooks.example/abc";

    fn manager() -> (CircuitBreakerManager, TestClock) {
        let clock = TestClock::new();
        let config = CircuitConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            half_open_max_probes: 1,
        };
        (CircuitBreakerManager::with_clock(config, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn circuit_starts_closed() {
        let (manager, _) = manager();
        assert!(manager.try_acquire(TARGET).await.is_ok());
        assert_eq!(manager.state(TARGET).await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn consecutive_failures_open_circuit() {
        let (manager, _) = manager();

        for _ in 0..2 {
            manager.record_failure(TARGET).await;
            assert!(manager.try_acquire(TARGET).await.is_ok());
        }
        manager.record_failure(TARGET).await;

        let err = manager.try_acquire(TARGET).await.unwrap_err();
        assert!(matches!(err, DeliveryError::CircuitOpen { ref target } if target == TARGET));
        assert_eq!(manager.open_circuits().await, 1);
        assert_eq!(manager.circuit_stats(TARGET).await.unwrap().rejected, 1);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let (manager, _) = manager();

        manager.record_failure(TARGET).await;
        manager.record_failure(TARGET).await;
        manager.record_success(TARGET).await;
        manager.record_failure(TARGET).await;

        assert_eq!(manager.state(TARGET).await, CircuitState::Closed);
        assert_eq!(manager.circuit_stats(TARGET).await.unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn cooldown_admits_single_probe() {
        let (manager, clock) = manager();
        manager.force_circuit_state(TARGET, CircuitState::Open).await;

        clock.advance(Duration::from_secs(59));
        assert!(manager.try_acquire(TARGET).await.is_err());

        clock.advance(Duration::from_secs(1));
        assert!(manager.try_acquire(TARGET).await.is_ok());
        assert_eq!(manager.state(TARGET).await, CircuitState::HalfOpen);
        assert!(manager.try_acquire(TARGET).await.is_err(), "only one probe at a time");
    }

    #[tokio::test]
    async fn probe_success_closes_circuit() {
        let (manager, clock) = manager();
        manager.force_circuit_state(TARGET, CircuitState::Open).await;
        clock.advance(Duration::from_secs(60));

        manager.try_acquire(TARGET).await.unwrap();
        manager.record_success(TARGET).await;

        assert_eq!(manager.state(TARGET).await, CircuitState::Closed);
        assert!(manager.try_acquire(TARGET).await.is_ok());
    }

    #[tokio::test]
    async fn probe_failure_reopens_circuit() {
        let (manager, clock) = manager();
        manager.force_circuit_state(TARGET, CircuitState::Open).await;
        clock.advance(Duration::from_secs(60));

        manager.try_acquire(TARGET).await.unwrap();
        manager.record_failure(TARGET).await;

        assert_eq!(manager.state(TARGET).await, CircuitState::Open);
        assert!(manager.try_acquire(TARGET).await.is_err());
    }

    #[tokio::test]
    async fn abandoned_probe_frees_slot() {
        let (manager, clock) = manager();
        manager.force_circuit_state(TARGET, CircuitState::Open).await;
        clock.advance(Duration::from_secs(60));

        manager.try_acquire(TARGET).await.unwrap();
        manager.record_abandoned(TARGET).await;
        assert!(manager.try_acquire(TARGET).await.is_ok());
    }

    #[tokio::test]
    async fn targets_are_independent() {
        let (manager, _) = manager();
        for _ in 0..3 {
            manager.record_failure(TARGET).await;
        }
        assert!(manager.try_acquire("https://hooks.example/other").await.is_ok());
    }
}
