use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use super::{request_error, AppState};

/// Constant-time string comparison to prevent timing side channels.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let result = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    result == 0
}

/// Admin auth middleware: requires `Authorization: Bearer <token>` when
/// an admin token is configured; an empty token disables the check
/// (safe only on loopback binds).
pub async fn admin_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let token = &state.config.server.admin_token;
    if token.is_empty() {
        return next.run(request).await;
    }

    if let Some(auth_header) = request.headers().get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(bearer) = auth_str.strip_prefix("Bearer ") {
                if constant_time_eq(bearer, token) {
                    return next.run(request).await;
                }
            }
        }
    }

    request_error(
        StatusCode::UNAUTHORIZED,
        "not_authenticated",
        "invalid or missing admin token",
    )
}

/// Authenticated user identity, resolved by the fronting auth proxy and
/// carried in a trusted header.
pub struct UserId(pub String);

impl FromRequestParts<Arc<AppState>> for UserId {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = &state.config.server.user_header;
        parts
            .headers
            .get(header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| UserId(s.to_string()))
            .ok_or_else(|| {
                request_error(
                    StatusCode::UNAUTHORIZED,
                    "not_authenticated",
                    "missing user identity",
                )
            })
    }
}
