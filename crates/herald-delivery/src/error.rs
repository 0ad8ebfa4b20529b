//! Error types for webhook dispatch and queueing.
//!
//! Covers every operational failure between a formatted message and the
//! chat endpoint: transport problems, HTTP rejections, open circuits and
//! queue backpressure. Each error knows whether it is worth retrying.

use std::fmt;

use herald_core::HeraldError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Delivery and queueing failures.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection could not be established or was reset.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Transport error description
        message: String,
    },

    /// Request did not complete within the client timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout in seconds
        timeout_seconds: u64,
    },

    /// Webhook rejected the message (4xx other than 429).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Webhook failed to process the message (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Webhook answered 429.
    #[error("rate limited{}", match .retry_after_seconds {
        Some(secs) => format!(": retry after {secs}s"),
        None => String::new(),
    })]
    RateLimited {
        /// Parsed `Retry-After`, if present and valid
        retry_after_seconds: Option<u64>,
    },

    /// Circuit for the target URL is open.
    #[error("circuit breaker open for {target}")]
    CircuitOpen {
        /// Webhook URL
        target: String,
    },

    /// Transient failures used up the retry budget.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Repository queue is at capacity.
    #[error("queue full for repository {repository}")]
    QueueFull {
        /// Repository whose queue overflowed
        repository: String,
    },

    /// Queue no longer accepts messages.
    #[error("queue closed")]
    QueueClosed,

    /// Invalid client or notifier configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// What was wrong
        message: String,
    },

    /// Workers did not drain before the shutdown deadline.
    #[error("shutdown timed out after {timeout_seconds}s with {remaining} workers active")]
    ShutdownTimeout {
        /// Deadline in seconds
        timeout_seconds: u64,
        /// Workers still running
        remaining: usize,
    },

    /// A worker task panicked.
    #[error("worker panicked: {message}")]
    WorkerPanic {
        /// Panic payload, if printable
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(target: impl Into<String>) -> Self {
        Self::CircuitOpen { target: target.into() }
    }

    /// Creates a queue full error.
    pub fn queue_full(repository: impl fmt::Display) -> Self {
        Self::QueueFull { repository: repository.to_string() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Whether the failure is transient and the message should be retried.
    ///
    /// True for transport errors, timeouts, 5xx and 429. Everything else is
    /// final for the message at hand.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. } => true,

            Self::ClientError { .. }
            | Self::CircuitOpen { .. }
            | Self::RetriesExhausted { .. }
            | Self::QueueFull { .. }
            | Self::QueueClosed
            | Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }

    /// Server-requested delay for rate limits.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// HTTP status carried by the error, if the webhook answered.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<DeliveryError> for HeraldError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::NetworkError { message } => Self::Transport(message),
            DeliveryError::Timeout { timeout_seconds } => {
                Self::Transport(format!("timed out after {timeout_seconds}s"))
            },
            DeliveryError::ClientError { status_code, .. } => {
                Self::Http4xxPermanent { status: status_code }
            },
            DeliveryError::ServerError { status_code, .. } => Self::Http5xx { status: status_code },
            DeliveryError::RateLimited { retry_after_seconds } => {
                Self::RateLimited { retry_after_seconds }
            },
            DeliveryError::CircuitOpen { target } => Self::CircuitOpen { target },
            DeliveryError::QueueFull { repository } => Self::QueueFull { repository },
            DeliveryError::QueueClosed => Self::ShuttingDown,
            other @ (DeliveryError::RetriesExhausted { .. }
            | DeliveryError::ConfigurationError { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }) => Self::Transport(other.to_string()),
        }
    }
}

/// Category of delivery error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Rate limiting.
    RateLimit,
    /// Circuit breaker protection.
    Circuit,
    /// Queue backpressure.
    Backpressure,
    /// Configuration problems.
    Configuration,
    /// Worker lifecycle failures.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } | DeliveryError::RetriesExhausted { .. } => {
                Self::Server
            },
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::CircuitOpen { .. } => Self::Circuit,
            DeliveryError::QueueFull { .. } | DeliveryError::QueueClosed => Self::Backpressure,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. } | DeliveryError::WorkerPanic { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Circuit => write!(f, "circuit"),
            Self::Backpressure => write!(f, "backpressure"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
