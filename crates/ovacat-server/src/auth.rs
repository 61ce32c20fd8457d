//! Shared bearer-token guard.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::settings::Settings;
use crate::AppState;

/// Whether a request carrying `headers` may proceed.
///
/// With auth disabled every request is permitted. Otherwise the request must
/// present `Authorization: Bearer <token>` matching the configured secret;
/// an empty configured secret refuses everything.
pub fn permits(settings: &Settings, headers: &HeaderMap) -> bool {
    if !settings.auth_required {
        return true;
    }
    if settings.auth_token.is_empty() {
        return false;
    }
    let Some(presented) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    else {
        return false;
    };
    presented
        .trim()
        .as_bytes()
        .ct_eq(settings.auth_token.as_bytes())
        .into()
}

/// Middleware rejecting unauthorized requests with an empty 401.
pub async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if permits(&state.settings, request.headers()) {
        next.run(request).await
    } else {
        debug!(path = %request.uri().path(), "rejecting unauthorized request");
        StatusCode::UNAUTHORIZED.into_response()
    }
}
