//! Trigger context: the facts about an incoming event.

use crate::pipeline::TriggerType;
use serde::{Deserialize, Serialize};

/// Everything known about the event that caused a pipeline run.
///
/// Dynamic pipeline sources are resolved against this, trigger filters
/// match on it, and condition expressions read `branch` and `event.type`
/// from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerContext {
    pub event_type: TriggerType,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TriggerContext {
    pub fn new(event_type: TriggerType) -> Self {
        Self {
            event_type,
            branch: None,
            commit_sha: None,
            repository: None,
            actor: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_commit(mut self, sha: impl Into<String>) -> Self {
        self.commit_sha = Some(sha.into());
        self
    }
}
