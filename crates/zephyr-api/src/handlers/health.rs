//! Health and metrics handlers.

use crate::state::AppState;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub running: bool,
    pub active_jobs: usize,
    pub max_concurrent: usize,
    pub queue_stats: HashMap<String, u64>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = state.scheduler.status().await;
    Json(HealthResponse {
        status: "healthy".to_string(),
        running: status.running,
        active_jobs: status.active_jobs,
        max_concurrent: status.max_concurrent,
        queue_stats: status.queue_stats,
    })
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}
