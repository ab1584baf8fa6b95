//! API route definitions.

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers::{health, jobs, runs, webhooks};
use crate::middleware;
use crate::state::AppState;
use crate::ws;

/// Create the main API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/trigger", post(runs::trigger))
        .route("/runs", get(runs::list_runs))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/logs", get(jobs::get_job_logs))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::require_api_key,
        ));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .route("/webhooks/{provider}", post(webhooks::receive))
        .route("/ws", get(ws::ws_handler))
        .layer(from_fn(middleware::request_id))
        .layer(middleware::cors_layer())
        .with_state(state)
}
