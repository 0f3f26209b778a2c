//! Bearer-token check for the OpenAI and operator surfaces.

use std::sync::Arc;

use arenabridge_core::Error;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

/// Rejects requests whose `Authorization: Bearer` token does not match the
/// configured key. No key configured means no check.
pub async fn require_api_key(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let expected = state.config.read().api_key.clone();
    if let Some(expected) = expected {
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        if presented != Some(expected.as_str()) {
            return ApiError(Error::Unauthorized).into_response();
        }
    }
    next.run(request).await
}
