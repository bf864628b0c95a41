//! HTTP surface: allocation, status, liveness ping, lifecycle webhook.

pub mod auth;
pub mod events;
pub mod machines;
pub mod system;

use std::sync::Arc;

use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::cloud::CloudProvider;
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::metrics::Metrics;
use crate::orchestrator::allocator::Allocator;
use crate::orchestrator::lifecycle::LifecycleReactor;
use crate::store::{PoolStore, SessionStore};

/// Shared state for all handlers, passed via axum `State`.
pub struct AppState {
    pub config: Arc<Config>,
    pub cloud: Arc<dyn CloudProvider>,
    pub sessions: Arc<dyn SessionStore>,
    pub pool: Arc<dyn PoolStore>,
    pub allocator: Arc<Allocator>,
    pub reactor: Arc<LifecycleReactor>,
    pub metrics: Metrics,
}

/// Structured failure body: `{status, message, errorKind}`.
#[derive(serde::Serialize)]
pub struct FailureBody {
    pub status: &'static str,
    pub message: String,
    #[serde(rename = "errorKind")]
    pub error_kind: String,
}

/// Map an orchestrator error onto a transport response.
pub fn error_response(err: &OrchestratorError) -> Response {
    let status = match err {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
        OrchestratorError::NoCapacity => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::BadInstance(_, _) => StatusCode::BAD_GATEWAY,
        OrchestratorError::TransientUpstream(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::PermissionDenied(_) | OrchestratorError::Fatal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let body = FailureBody {
        status: "error",
        message: err.to_string(),
        error_kind: err.kind().to_string(),
    };
    (status, Json(body)).into_response()
}

/// Failure response for requests that never reached the core.
pub fn request_error(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    let body = FailureBody {
        status: "error",
        message: message.into(),
        error_kind: kind.to_string(),
    };
    (status, Json(body)).into_response()
}

/// Build the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/status", get(system::status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::admin_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics))
        .merge(admin)
        .route("/machines/allocate", post(machines::allocate))
        .route("/machines/status", get(machines::status))
        .route("/ping", post(events::ping))
        .route("/webhook/lifecycle", post(events::lifecycle_webhook))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.server.bind_addr, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "http server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_responses_carry_taxonomy_status() {
        let resp = error_response(&OrchestratorError::NotFound("x".into()));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = error_response(&OrchestratorError::Conflict("u".into()));
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = error_response(&OrchestratorError::TransientUpstream("io".into()));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = error_response(&OrchestratorError::BadInstance("i".into(), "m".into()));
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let resp = error_response(&OrchestratorError::PermissionDenied("iam".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
