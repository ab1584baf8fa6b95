//! Trigger and run handlers.

use crate::state::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zephyr_core::context::TriggerContext;
use zephyr_core::ids::ProjectId;
use zephyr_core::pipeline::TriggerType;
use zephyr_core::ports::RunFilter;
use zephyr_core::run::{PipelineRun, RunStatus};
use zephyr_core::Error;

#[derive(Deserialize)]
pub struct TriggerRequest {
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub pipeline: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
}

#[derive(Serialize)]
pub struct TriggerResponse {
    pub id: String,
    pub status: String,
}

fn internal(e: Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>), (StatusCode, String)> {
    let project_id: ProjectId = request
        .project_id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid project ID".to_string()))?;

    let project = state
        .store
        .get_project(&project_id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "Project not found".to_string()))?;

    let mut ctx = TriggerContext::new(TriggerType::Api);
    ctx.branch = request.branch;
    ctx.commit_sha = request.sha;

    let run_id = state
        .scheduler
        .queue_pipeline_run(&project, &request.pipeline, &ctx)
        .await
        .map_err(|e| match e {
            Error::InvalidConfig(_) | Error::CyclicDependency(_) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            Error::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
            other => internal(other),
        })?;

    Ok((
        StatusCode::CREATED,
        Json(TriggerResponse {
            id: run_id.to_string(),
            status: "queued".to_string(),
        }),
    ))
}

#[derive(Deserialize)]
pub struct ListRunsParams {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Serialize)]
pub struct RunResponse {
    pub id: String,
    pub project_id: String,
    pub pipeline_name: String,
    pub trigger_type: String,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub status: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl From<&PipelineRun> for RunResponse {
    fn from(run: &PipelineRun) -> Self {
        Self {
            id: run.id.to_string(),
            project_id: run.project_id.to_string(),
            pipeline_name: run.pipeline_name.clone(),
            trigger_type: run.trigger_type.as_str().to_string(),
            branch: run.branch.clone(),
            commit_sha: run.commit_sha.clone(),
            status: run.status.as_str().to_string(),
            created_at: run.created_at.to_rfc3339(),
            started_at: run.started_at.map(|t| t.to_rfc3339()),
            finished_at: run.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<Vec<RunResponse>>, (StatusCode, String)> {
    let project_id = params
        .project
        .as_deref()
        .map(str::parse::<ProjectId>)
        .transpose()
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid project ID".to_string()))?;

    let status = params
        .status
        .as_deref()
        .map(|s| {
            RunStatus::parse(s)
                .ok_or((StatusCode::BAD_REQUEST, format!("Unknown status '{s}'")))
        })
        .transpose()?;

    let runs = state
        .store
        .list_pipeline_runs(&RunFilter {
            project_id,
            status,
            limit: params.limit,
        })
        .await
        .map_err(internal)?;

    Ok(Json(runs.iter().map(RunResponse::from).collect()))
}
