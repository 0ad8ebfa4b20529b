//! Event ingest endpoint.
//!
//! Accepts repository events from the hosting server and hands them to the
//! notifier through the event channel. Acceptance only means the event was
//! sequenced; filtering and delivery happen asynchronously.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use herald_core::{EventId, EventPayload, EventType, HeraldError};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{error_response, repository_from_path};
use crate::AppState;

/// Event submitted by the hosting server.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    /// Kind of event.
    pub event_type: EventType,
    /// Event body.
    pub payload: EventPayload,
    /// When the event happened; defaults to receipt time.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

/// Acknowledgement for an accepted event.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Identifier assigned to the event.
    pub event_id: EventId,
    /// Position in the notifier's event sequence.
    pub sequence: u64,
}

/// Publishes an event for notification.
///
/// Returns 202 once the event is sequenced, or 503 when the notifier has
/// stopped accepting events.
#[instrument(name = "ingest_event", skip(state, request))]
pub async fn ingest_event(
    State(state): State<AppState>,
    Path((project, slug)): Path<(String, String)>,
    Json(request): Json<IngestRequest>,
) -> Response {
    let repository = match repository_from_path(&project, &slug) {
        Ok(repository) => repository,
        Err(response) => return response,
    };

    if state.notifier.is_shutting_down() {
        return error_response(&HeraldError::ShuttingDown);
    }

    let occurred_at = request.occurred_at.unwrap_or_else(|| state.clock.now_utc());
    match state.publisher.publish(repository, request.event_type, request.payload, occurred_at).await
    {
        Ok(event) => {
            info!(
                repository = %event.repository_id,
                event_id = %event.id,
                event_type = %event.event_type,
                sequence = event.sequence,
                "event accepted"
            );
            let body = IngestResponse { event_id: event.id, sequence: event.sequence };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        },
        Err(e) => {
            warn!(error = %e, "event rejected");
            error_response(&HeraldError::from(e))
        },
    }
}
