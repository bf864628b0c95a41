use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::auth::UserId;
use super::{error_response, request_error, AppState};
use crate::error::OrchestratorError;
use crate::store::WorkspaceState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocateResponse {
    instance_id: String,
    public_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_domain: Option<String>,
}

#[derive(Serialize)]
struct ProcessingResponse {
    status: &'static str,
    message: &'static str,
}

/// `POST /machines/allocate` — bind the caller to a workspace.
///
/// Idempotent for callers that already hold a running workspace. An
/// empty warm pool surfaces as `202` with retry advice.
pub async fn allocate(State(state): State<Arc<AppState>>, UserId(user_id): UserId) -> Response {
    match state.allocator.allocate(&user_id).await {
        Ok(record) => (
            StatusCode::OK,
            Json(AllocateResponse {
                instance_id: record.instance_id,
                public_url: record.public_endpoint,
                custom_domain: record.custom_domain,
            }),
        )
            .into_response(),
        Err(OrchestratorError::NoCapacity) => (
            StatusCode::ACCEPTED,
            Json(ProcessingResponse {
                status: "processing",
                message: "capacity is being provisioned, retry shortly",
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    instance_id: String,
    public_url: String,
    state: WorkspaceState,
    last_seen: i64,
}

/// `GET /machines/status` — the caller's current workspace, if any.
pub async fn status(State(state): State<Arc<AppState>>, UserId(user_id): UserId) -> Response {
    match state.sessions.workspace(&user_id).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(StatusResponse {
                instance_id: record.instance_id,
                public_url: record.public_endpoint,
                state: record.state,
                last_seen: record.last_seen,
            }),
        )
            .into_response(),
        Ok(None) => request_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no workspace for user {user_id}"),
        ),
        Err(e) => error_response(&e),
    }
}
