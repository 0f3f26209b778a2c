//! HTTP route handlers.

pub mod auth;
pub mod internal;
pub mod openai;
pub mod relay;

use std::sync::Arc;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let guard = middleware::from_fn_with_state(state.clone(), auth::require_api_key);
    let v1 = openai::routes().route_layer(guard.clone());
    let operator = internal::routes().route_layer(guard);

    Router::new()
        .nest("/v1", v1)
        .nest("/internal", operator)
        .merge(relay::routes())
        .route("/health", get(internal::health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
