//! Error types and result handling for notifier operations.
//!
//! `CoreError` covers failures inside this crate (validation and storage).
//! `HeraldError` is the coded taxonomy surfaced at the API boundary, with
//! codes grouped by origin: E1xxx for caller input, E2xxx for delivery and
//! E3xxx for system resources.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Settings violate their write-time invariants.
    #[error("Invalid settings: {reason}")]
    InvalidSettings {
        /// What was wrong with the submitted value
        reason: String,
    },

    /// Repository identifier could not be parsed.
    #[error("Invalid repository id: {0}")]
    InvalidRepositoryId(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Stored value could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Creates an invalid settings error.
    pub fn invalid_settings(reason: impl Into<String>) -> Self {
        Self::InvalidSettings { reason: reason.into() }
    }

    /// Returns true for errors caused by caller input rather than the system.
    pub const fn is_user_error(&self) -> bool {
        matches!(self, Self::InvalidSettings { .. } | Self::InvalidRepositoryId(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Serialization(err.to_string())
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Herald error types with stable codes for API clients.
#[derive(Debug, Error)]
pub enum HeraldError {
    // Input errors (E1001-E1004)
    /// Settings rejected at write time (E1001).
    #[error("[E1001] Invalid settings: {reason}")]
    InvalidSettings {
        /// Validation failure description
        reason: String,
    },

    /// Repository path is malformed (E1002).
    #[error("[E1002] Invalid repository: {0}")]
    InvalidRepository(String),

    /// Event body could not be understood (E1003).
    #[error("[E1003] Invalid event: {0}")]
    InvalidEvent(String),

    /// Formatter could not render an event (E1004).
    #[error("[E1004] Formatter error: {0}")]
    FormatterError(String),

    // Delivery errors (E2001-E2005)
    /// Network or timeout failure talking to the webhook (E2001).
    #[error("[E2001] Transport error: {0}")]
    Transport(String),

    /// Webhook answered with a 5xx status (E2002).
    #[error("[E2002] HTTP server error: {status} response from webhook")]
    Http5xx {
        /// HTTP status code returned by the webhook
        status: u16,
    },

    /// Webhook asked us to slow down (E2003).
    #[error("[E2003] Rate limited by webhook")]
    RateLimited {
        /// Seconds requested by `Retry-After`, if any
        retry_after_seconds: Option<u64>,
    },

    /// Webhook rejected the message permanently (E2004).
    #[error("[E2004] HTTP client error: {status} response from webhook")]
    Http4xxPermanent {
        /// HTTP status code returned by the webhook
        status: u16,
    },

    /// Circuit breaker is open for the target (E2005).
    #[error("[E2005] Circuit open: deliveries to {target} are paused")]
    CircuitOpen {
        /// Webhook URL whose circuit is open
        target: String,
    },

    // System errors (E3001-E3003)
    /// Settings storage unavailable (E3001).
    #[error("[E3001] Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Repository queue at capacity (E3002).
    #[error("[E3002] Queue full: {repository} queue at capacity")]
    QueueFull {
        /// Repository whose queue is full
        repository: String,
    },

    /// Notifier no longer accepts events (E3003).
    #[error("[E3003] Shutting down: notifier is not accepting events")]
    ShuttingDown,
}

impl HeraldError {
    /// Returns the error code (E1001-E3003).
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidSettings { .. } => "E1001",
            Self::InvalidRepository(_) => "E1002",
            Self::InvalidEvent(_) => "E1003",
            Self::FormatterError(_) => "E1004",
            Self::Transport(_) => "E2001",
            Self::Http5xx { .. } => "E2002",
            Self::RateLimited { .. } => "E2003",
            Self::Http4xxPermanent { .. } => "E2004",
            Self::CircuitOpen { .. } => "E2005",
            Self::StorageUnavailable(_) => "E3001",
            Self::QueueFull { .. } => "E3002",
            Self::ShuttingDown => "E3003",
        }
    }

    /// Returns whether this error should trigger a retry.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http5xx { .. } | Self::RateLimited { .. })
    }
}

impl From<CoreError> for HeraldError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidSettings { reason } => Self::InvalidSettings { reason },
            CoreError::InvalidRepositoryId(msg) => Self::InvalidRepository(msg),
            CoreError::Database(msg) | CoreError::Serialization(msg) => {
                Self::StorageUnavailable(msg)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(HeraldError::InvalidSettings { reason: String::new() }.code(), "E1001");
        assert_eq!(HeraldError::Http5xx { status: 502 }.code(), "E2002");
        assert_eq!(HeraldError::Http4xxPermanent { status: 404 }.code(), "E2004");
        assert_eq!(HeraldError::QueueFull { repository: "P/r".into() }.code(), "E3002");
    }

    #[test]
    fn only_transient_delivery_errors_are_retryable() {
        assert!(HeraldError::Transport("reset".into()).is_retryable());
        assert!(HeraldError::Http5xx { status: 503 }.is_retryable());
        assert!(HeraldError::RateLimited { retry_after_seconds: Some(3) }.is_retryable());
        assert!(!HeraldError::Http4xxPermanent { status: 400 }.is_retryable());
        assert!(!HeraldError::CircuitOpen { target: "https://x".into() }.is_retryable());
        assert!(!HeraldError::FormatterError("missing pr".into()).is_retryable());
    }

    #[test]
    fn core_errors_map_to_coded_errors() {
        let err: HeraldError = CoreError::invalid_settings("webhook url is required").into();
        assert_eq!(err.code(), "E1001");
        assert!(err.to_string().contains("webhook url is required"));

        let err: HeraldError = CoreError::Database("pool closed".into()).into();
        assert_eq!(err.code(), "E3001");
    }

    #[test]
    fn user_errors_are_distinguished() {
        assert!(CoreError::invalid_settings("x").is_user_error());
        assert!(CoreError::InvalidRepositoryId("x".into()).is_user_error());
        assert!(!CoreError::Database("x".into()).is_user_error());
    }
}
