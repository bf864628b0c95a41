use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{error_response, request_error, AppState};
use crate::error::OrchestratorError;
use crate::orchestrator::lifecycle::{EventEnvelope, LifecycleEvent};
use crate::orchestrator::now_ms;

#[derive(Deserialize)]
pub(crate) struct PingRequest {
    #[serde(rename = "instanceId")]
    instance_id: String,
}

#[derive(Serialize)]
struct PingResponse {
    ok: bool,
    timestamp: i64,
}

/// `POST /ping` — liveness signal from the instance itself. The only
/// external mutator of `lastSeen`.
pub async fn ping(State(state): State<Arc<AppState>>, Json(req): Json<PingRequest>) -> Response {
    if req.instance_id.is_empty() {
        return request_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "instanceId must not be empty",
        );
    }

    let user_id = match state.sessions.user_for_instance(&req.instance_id).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            return request_error(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("instance {} is not bound", req.instance_id),
            )
        }
        Err(e) => return error_response(&e),
    };

    let now = now_ms();
    match state.sessions.record_ping(&user_id, now).await {
        Ok(()) => (
            StatusCode::OK,
            Json(PingResponse {
                ok: true,
                timestamp: now,
            }),
        )
            .into_response(),
        // The binding raced a cleanup; from the caller's view the
        // instance is simply no longer bound.
        Err(e @ OrchestratorError::NotFound(_)) => {
            request_error(StatusCode::NOT_FOUND, "not_found", e.to_string())
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Serialize)]
struct AckResponse {
    ok: bool,
}

/// `POST /webhook/lifecycle` — provider-signed launch/terminate events.
///
/// Acknowledged immediately; the readiness poll runs on a detached task
/// so the provider's retry timer never expires on us.
pub async fn lifecycle_webhook(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<EventEnvelope>,
) -> Response {
    match LifecycleEvent::from_envelope(&envelope) {
        Some(event) => {
            debug!(instance_id = event.instance_id(), "lifecycle event accepted");
            let reactor = state.reactor.clone();
            tokio::spawn(async move { reactor.handle(event).await });
            (StatusCode::OK, Json(AckResponse { ok: true })).into_response()
        }
        None => request_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("unsupported lifecycle event: {}", envelope.event),
        ),
    }
}
