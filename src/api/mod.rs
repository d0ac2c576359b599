//! HTTP API: webhook intake and health endpoints.

mod health;
mod webhook;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the daemon router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(webhook::handle))
        .route("/healthz", get(health::healthz))
        .route("/livez", get(health::livez))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
