//! Job inspection handlers.

use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use zephyr_core::ids::JobId;
use zephyr_core::run::{Job, LogRecord};

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, (StatusCode, String)> {
    let job = state
        .store
        .get_job(&JobId::from_string(id))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "Job not found".to_string()))?;
    Ok(Json(job))
}

#[derive(Deserialize)]
pub struct LogsParams {
    /// Return only records with `seq > since`.
    #[serde(default)]
    pub since: Option<u64>,
}

pub async fn get_job_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Vec<LogRecord>>, (StatusCode, String)> {
    let logs = state
        .store
        .get_logs_for_job(&JobId::from_string(id), params.since)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(logs))
}
