use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::{error_response, AppState};
use crate::cloud::CloudProvider;
use crate::error::OrchResult;
use crate::store::{PoolStore, SessionStore};

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "uptimeSeconds": state.metrics.uptime_seconds(),
        })),
    )
        .into_response()
}

/// Admin view of the fleet, shared with `devpool status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub active_users: u64,
    pub warm_spares: u64,
    pub total_instances: usize,
    pub asg_capacity: u32,
}

pub async fn fleet_snapshot(
    sessions: &dyn SessionStore,
    pool: &dyn PoolStore,
    cloud: &dyn CloudProvider,
) -> OrchResult<FleetSnapshot> {
    let active_users = sessions.active_count().await?;
    let warm_spares = pool.size().await?;
    let group = cloud.describe_asg().await?;
    Ok(FleetSnapshot {
        active_users,
        warm_spares,
        total_instances: group.instance_ids.len(),
        asg_capacity: group.desired_capacity,
    })
}

/// `GET /status` (admin)
pub async fn status(State(state): State<Arc<AppState>>) -> Response {
    match fleet_snapshot(
        state.sessions.as_ref(),
        state.pool.as_ref(),
        state.cloud.as_ref(),
    )
    .await
    {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        state.metrics.encode(),
    )
        .into_response()
}
