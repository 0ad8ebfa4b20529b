//! Configuration for the herald notifier service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_delivery::{
    BackoffStrategy, CircuitConfig, ClientConfig, NotifierConfig, OverflowPolicy, QueueConfig,
    RetryPolicy,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "herald.toml";

/// Environment variables read on top of the file, matched case-insensitively
/// against the field names below.
const ENV_KEYS: &[&str] = &[
    "DATABASE_URL",
    "DATABASE_MAX_CONNECTIONS",
    "HOST",
    "PORT",
    "REQUEST_TIMEOUT",
    "WORKER_POOL_SIZE",
    "QUEUE_CAPACITY",
    "QUEUE_OVERFLOW_POLICY",
    "EVENT_BUFFER_SIZE",
    "MAX_RETRY_ATTEMPTS",
    "RETRY_BASE_DELAY_MS",
    "RETRY_MAX_DELAY_MS",
    "RETRY_JITTER_FACTOR",
    "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
    "CIRCUIT_BREAKER_COOLDOWN_SECONDS",
    "DELIVERY_TIMEOUT_SECONDS",
    "SHUTDOWN_TIMEOUT_SECONDS",
    "RUST_LOG",
];

/// Service configuration with defaults, file, and environment overrides.
///
/// Sources in priority order:
/// 1. Environment variables (highest)
/// 2. `herald.toml` in the working directory
/// 3. Built-in defaults
///
/// # Example
///
/// ```no_run
/// use herald_api::Config;
///
/// let config = Config::load().expect("configuration loads");
/// println!("listening on {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Storage
    /// SQLite connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    pub database_url: String,
    /// Maximum pooled connections.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    pub database_max_connections: u32,

    // Server
    /// Bind address.
    ///
    /// Environment variable: `HOST`
    pub host: String,
    /// Bind port.
    ///
    /// Environment variable: `PORT`
    pub port: u16,
    /// Per-request timeout for the admin API in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    pub request_timeout: u64,

    // Notifier
    /// Maximum concurrent webhook deliveries.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    pub worker_pool_size: usize,
    /// Messages held per repository queue.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    pub queue_capacity: usize,
    /// What to do when a repository queue is full.
    ///
    /// Environment variable: `QUEUE_OVERFLOW_POLICY`
    pub queue_overflow_policy: OverflowPolicy,
    /// Events buffered between the ingest API and the notifier.
    ///
    /// Environment variable: `EVENT_BUFFER_SIZE`
    pub event_buffer_size: usize,

    // Retry
    /// Retries after the first attempt.
    ///
    /// Environment variable: `MAX_RETRY_ATTEMPTS`
    pub max_retry_attempts: u32,
    /// Delay before the first retry in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    pub retry_base_delay_ms: u64,
    /// Upper bound for backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    pub retry_max_delay_ms: u64,
    /// Jitter fraction (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    pub retry_jitter_factor: f64,

    // Circuit breaker
    /// Consecutive permanent failures that open a circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_THRESHOLD`
    pub circuit_breaker_failure_threshold: u32,
    /// Seconds an open circuit rejects deliveries.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_COOLDOWN_SECONDS`
    pub circuit_breaker_cooldown_seconds: u64,

    // Client
    /// Webhook request timeout in seconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_SECONDS`
    pub delivery_timeout_seconds: u64,
    /// Seconds allowed for in-flight deliveries at shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    pub shutdown_timeout_seconds: u64,

    // Logging
    /// Tracing filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `herald.toml`, and the environment.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or the result does not validate.
    pub fn load() -> Result<Self> {
        Self::figment().extract::<Self>().context("failed to load configuration")?.validated()
    }

    /// Layered configuration sources, exposed for callers that add their own.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::raw().only(ENV_KEYS))
    }

    fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Notifier configuration.
    pub fn to_notifier_config(&self) -> NotifierConfig {
        NotifierConfig {
            worker_count: self.worker_pool_size,
            queue: self.to_queue_config(),
            client: self.to_client_config(),
            retry: self.to_retry_policy(),
            circuit: self.to_circuit_config(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Queue configuration.
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig { capacity: self.queue_capacity, overflow_policy: self.queue_overflow_policy }
    }

    /// Webhook client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            ..ClientConfig::default()
        }
    }

    /// Retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: BackoffStrategy::Exponential,
            ..RetryPolicy::default()
        }
    }

    /// Circuit breaker configuration. Half-open admits a single probe.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            cooldown: Duration::from_secs(self.circuit_breaker_cooldown_seconds),
            half_open_max_probes: 1,
        }
    }

    /// Parses the bind address.
    ///
    /// # Errors
    ///
    /// Fails if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr).with_context(|| format!("invalid server address: {addr}"))
    }

    /// Database URL with any password replaced by `***`.
    pub fn database_url_masked(&self) -> String {
        if let Some(at) = self.database_url.find('@') {
            if let Some(colon) = self.database_url[..at].rfind(':') {
                if !self.database_url[..colon].ends_with('/') {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon + 1..at, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }
        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }
        if self.event_buffer_size == 0 {
            anyhow::bail!("event_buffer_size must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            anyhow::bail!("retry_max_delay_ms must not be less than retry_base_delay_ms");
        }
        if self.circuit_breaker_failure_threshold == 0 {
            anyhow::bail!("circuit_breaker_failure_threshold must be greater than 0");
        }
        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }

        self.to_notifier_config().validate().context("notifier configuration rejected")?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://herald.db".to_string(),
            database_max_connections: 5,
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: 30,
            worker_pool_size: herald_delivery::DEFAULT_WORKER_COUNT,
            queue_capacity: herald_delivery::queue::DEFAULT_QUEUE_CAPACITY,
            queue_overflow_policy: OverflowPolicy::default(),
            event_buffer_size: 1024,
            max_retry_attempts: 5,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            retry_jitter_factor: 0.2,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_cooldown_seconds: 60,
            delivery_timeout_seconds: herald_delivery::DEFAULT_TIMEOUT_SECONDS,
            shutdown_timeout_seconds: herald_delivery::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
            rust_log: "info,herald=debug,tower_http=debug".to_string(),
        }
    }
}
