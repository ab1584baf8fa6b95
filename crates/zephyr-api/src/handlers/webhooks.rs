//! Webhook ingest.
//!
//! The raw body is retained and persisted before JSON parsing so that
//! provider signatures can be verified against exactly what was sent.

use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use zephyr_core::context::TriggerContext;
use zephyr_core::ids::DeliveryId;
use zephyr_core::pipeline::TriggerType;
use zephyr_core::run::WebhookDelivery;

#[derive(Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub runs: Vec<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub async fn receive(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, (StatusCode, String)> {
    let (signature, event_header) = match provider.as_str() {
        "github" => (
            header_str(&headers, "x-hub-signature-256"),
            header_str(&headers, "x-github-event"),
        ),
        "gitlab" => (
            header_str(&headers, "x-gitlab-token"),
            header_str(&headers, "x-gitlab-event"),
        ),
        _ => (
            header_str(&headers, "x-webhook-signature"),
            header_str(&headers, "x-webhook-event"),
        ),
    };
    let event_name = event_header.unwrap_or("webhook").to_string();

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")))?;

    let delivery = WebhookDelivery {
        id: DeliveryId::new(),
        provider: provider.clone(),
        event_type: event_name.clone(),
        payload: payload.clone(),
        signature: signature.map(String::from),
        received_at: Utc::now(),
    };
    state
        .store
        .save_webhook_delivery(&delivery)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let ctx = context_from_payload(&event_name, &payload);

    let projects = state
        .store
        .list_projects()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut runs = Vec::new();
    for project in &projects {
        match state.scheduler.handle_trigger(project, &ctx).await {
            Ok(run_ids) => runs.extend(run_ids.iter().map(|id| id.to_string())),
            Err(e) => {
                warn!(project = %project.name, error = %e, "Webhook trigger failed");
            }
        }
    }

    Ok(Json(WebhookResponse {
        received: true,
        runs,
    }))
}

fn context_from_payload(event_name: &str, payload: &serde_json::Value) -> TriggerContext {
    let event_type = match event_name {
        "push" | "Push Hook" => TriggerType::Push,
        "pull_request" | "merge_request" | "Merge Request Hook" => TriggerType::PullRequest,
        _ => TriggerType::Webhook,
    };

    let branch = payload["ref"]
        .as_str()
        .map(|r| r.strip_prefix("refs/heads/").unwrap_or(r).to_string())
        .or_else(|| {
            payload["pull_request"]["head"]["ref"]
                .as_str()
                .map(String::from)
        });

    let commit_sha = payload["after"]
        .as_str()
        .or_else(|| payload["checkout_sha"].as_str())
        .or_else(|| payload["pull_request"]["head"]["sha"].as_str())
        .map(String::from);

    TriggerContext {
        event_type,
        branch,
        commit_sha,
        repository: payload["repository"]["full_name"].as_str().map(String::from),
        actor: payload["sender"]["login"]
            .as_str()
            .or_else(|| payload["user_username"].as_str())
            .map(String::from),
        payload: payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_context_extraction() {
        let payload = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc123",
            "repository": { "full_name": "acme/widget" },
            "sender": { "login": "dev" },
        });
        let ctx = context_from_payload("push", &payload);
        assert_eq!(ctx.event_type, TriggerType::Push);
        assert_eq!(ctx.branch.as_deref(), Some("main"));
        assert_eq!(ctx.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(ctx.repository.as_deref(), Some("acme/widget"));
    }

    #[test]
    fn test_pull_request_context_extraction() {
        let payload = serde_json::json!({
            "pull_request": { "head": { "ref": "feature", "sha": "def456" } },
        });
        let ctx = context_from_payload("pull_request", &payload);
        assert_eq!(ctx.event_type, TriggerType::PullRequest);
        assert_eq!(ctx.branch.as_deref(), Some("feature"));
        assert_eq!(ctx.commit_sha.as_deref(), Some("def456"));
    }
}
