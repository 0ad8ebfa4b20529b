//! HTTP request handlers.
//!
//! Every handler reports failures as `{"error": {"code", "message"}}` with
//! a status derived from the [`HeraldError`] taxonomy.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_core::{HeraldError, RepositoryId};
use serde::Serialize;

pub mod events;
pub mod health;
pub mod settings;

pub use events::ingest_event;
pub use health::{health_check, liveness_check};
pub use settings::{get_settings, put_settings, submit_settings_form};

/// Standard error response format.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code from the taxonomy (E1001-E3003)
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// HTTP status for an error surfaced by a handler.
pub fn status_for(error: &HeraldError) -> StatusCode {
    match error {
        HeraldError::InvalidSettings { .. }
        | HeraldError::InvalidEvent(_)
        | HeraldError::FormatterError(_) => StatusCode::BAD_REQUEST,
        HeraldError::InvalidRepository(_) => StatusCode::NOT_FOUND,
        HeraldError::StorageUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        HeraldError::QueueFull { .. } | HeraldError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        },
        HeraldError::Transport(_)
        | HeraldError::Http5xx { .. }
        | HeraldError::RateLimited { .. }
        | HeraldError::Http4xxPermanent { .. }
        | HeraldError::CircuitOpen { .. } => StatusCode::BAD_GATEWAY,
    }
}

/// Builds the JSON error response for `error`.
pub fn error_response(error: &HeraldError) -> Response {
    create_error_response(status_for(error), error)
}

fn create_error_response(status: StatusCode, error: &HeraldError) -> Response {
    let error_response = ErrorResponse {
        error: ErrorDetail { code: error.code().to_string(), message: error.to_string() },
    };

    (status, Json(error_response)).into_response()
}

/// Parses the `{project}/{slug}` path pair.
fn repository_from_path(project: &str, slug: &str) -> Result<RepositoryId, Response> {
    RepositoryId::new(project, slug).map_err(|e| error_response(&HeraldError::from(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_are_client_errors() {
        let invalid = HeraldError::InvalidSettings { reason: "missing url".into() };
        assert_eq!(status_for(&invalid), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&HeraldError::InvalidRepository("bad".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn system_errors_are_server_errors() {
        assert_eq!(
            status_for(&HeraldError::StorageUnavailable("pool closed".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status_for(&HeraldError::ShuttingDown), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&HeraldError::Http5xx { status: 502 }),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn malformed_repository_path_is_not_found() {
        let response = repository_from_path("", "repo").unwrap_err();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
