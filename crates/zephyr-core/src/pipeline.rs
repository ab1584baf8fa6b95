//! Pipeline definition types.
//!
//! These types represent the user-authored declarative configuration: a
//! project exporting one or more pipelines, each pipeline a set of jobs
//! with triggers, dependencies, optional matrices, and ordered steps.

use crate::context::TriggerContext;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The parsed configuration module: project metadata plus its pipelines.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub project: ProjectMeta,
    pub pipelines: PipelinesSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Pipelines are either a concrete list or a computation from the trigger
/// context, evaluated once per trigger.
#[derive(Clone)]
pub enum PipelinesSource {
    Static(Vec<PipelineDefinition>),
    Dynamic(Arc<dyn Fn(&TriggerContext) -> Vec<PipelineDefinition> + Send + Sync>),
}

impl fmt::Debug for PipelinesSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelinesSource::Static(p) => f.debug_tuple("Static").field(&p.len()).finish(),
            PipelinesSource::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

// Configuration files always carry a concrete list; dynamic sources are
// constructed programmatically.
impl<'de> Deserialize<'de> for PipelinesSource {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(PipelinesSource::Static(Vec::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub jobs: Vec<JobDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Branch filters; empty means every branch matches.
    #[serde(default)]
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Push,
    PullRequest,
    Cron,
    Manual,
    Api,
    Webhook,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Push => "push",
            TriggerType::PullRequest => "pull_request",
            TriggerType::Cron => "cron",
            TriggerType::Manual => "manual",
            TriggerType::Api => "api",
            TriggerType::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub runner: RunnerSpec,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSpec {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub kind: RunnerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    #[default]
    MicroVm,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Optional stable id; step outputs are addressed as
    /// `steps.<id>.outputs.<name>`. Defaults to the step name.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl StepDefinition {
    /// The key under which this step's outputs and outcome are recorded.
    pub fn output_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

fn default_shell() -> String {
    "bash".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Run a shell command.
    Run { command: String },
    /// Provision a runtime onto `PATH` for subsequent steps.
    Setup { runtime: String, version: String },
}

/// A step or job condition: a pre-supplied boolean, or an expression over
/// `branch`, `event.type`, `needs.<job>.status` and `steps.<id>.outcome`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Bool(bool),
    Expression(String),
}

/// Matrix sweep configuration attached to a job definition.
///
/// Dimension declaration order is semantic (it fixes expansion order and
/// instance naming), so `values` preserves document order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub values: MatrixDimensions,
    #[serde(default)]
    pub exclude: Vec<MatrixSelection>,
    #[serde(default)]
    pub include: Vec<MatrixSelection>,
    /// Advisory only; global concurrency is governed by the scheduler cap.
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

/// Ordered matrix dimensions: `(name, candidate values)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixDimensions(pub Vec<(String, Vec<MatrixValue>)>);

impl MatrixDimensions {
    pub fn iter(&self) -> impl Iterator<Item = &(String, Vec<MatrixValue>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for MatrixDimensions {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, values) in &self.0 {
            map.serialize_entry(key, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixDimensions {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DimVisitor;

        impl<'de> Visitor<'de> for DimVisitor {
            type Value = MatrixDimensions;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of dimension name to list of values")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((key, values)) =
                    access.next_entry::<String, Vec<MatrixValue>>()?
                {
                    entries.push((key, values));
                }
                Ok(MatrixDimensions(entries))
            }
        }

        deserializer.deserialize_map(DimVisitor)
    }
}

/// An ordered `(key, value)` set used by matrix `include` and `exclude`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixSelection(pub Vec<(String, MatrixValue)>);

impl MatrixSelection {
    pub fn get(&self, key: &str) -> Option<&MatrixValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, MatrixValue)> {
        self.0.iter()
    }
}

impl Serialize for MatrixSelection {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixSelection {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SelVisitor;

        impl<'de> Visitor<'de> for SelVisitor {
            type Value = MatrixSelection;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of dimension name to value")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, MatrixValue>()? {
                    entries.push((key, value));
                }
                Ok(MatrixSelection(entries))
            }
        }

        deserializer.deserialize_map(SelVisitor)
    }
}

/// A matrix scalar: string, number, or boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatrixValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl fmt::Display for MatrixValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixValue::Bool(b) => write!(f, "{}", b),
            MatrixValue::Number(n) => write!(f, "{}", n),
            MatrixValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for MatrixValue {
    fn from(s: &str) -> Self {
        MatrixValue::String(s.to_string())
    }
}

impl From<i64> for MatrixValue {
    fn from(n: i64) -> Self {
        MatrixValue::Number(n as f64)
    }
}

impl From<bool> for MatrixValue {
    fn from(b: bool) -> Self {
        MatrixValue::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_dimensions_preserve_order() {
        let yaml = r#"
os: [ubuntu, alpine]
node: [18, 20]
arch: [amd64]
"#;
        let dims: MatrixDimensions = serde_yaml::from_str(yaml).unwrap();
        let keys: Vec<&str> = dims.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["os", "node", "arch"]);
    }

    #[test]
    fn test_matrix_value_stringification() {
        assert_eq!(MatrixValue::from("ubuntu").to_string(), "ubuntu");
        assert_eq!(MatrixValue::from(18).to_string(), "18");
        assert_eq!(MatrixValue::Number(1.5).to_string(), "1.5");
        assert_eq!(MatrixValue::from(true).to_string(), "true");
    }

    #[test]
    fn test_step_kind_tagged_parse() {
        let yaml = r#"
name: build
type: run
command: cargo build
"#;
        let step: StepDefinition = serde_yaml::from_str(yaml).unwrap();
        match step.kind {
            StepKind::Run { ref command } => assert_eq!(command, "cargo build"),
            _ => panic!("expected run step"),
        }
        assert_eq!(step.shell, "bash");
        assert_eq!(step.output_id(), "build");
    }

    #[test]
    fn test_setup_step_parse() {
        let yaml = r#"
name: install node
type: setup
runtime: node
version: "20"
"#;
        let step: StepDefinition = serde_yaml::from_str(yaml).unwrap();
        match step.kind {
            StepKind::Setup {
                ref runtime,
                ref version,
            } => {
                assert_eq!(runtime, "node");
                assert_eq!(version, "20");
            }
            _ => panic!("expected setup step"),
        }
    }

    #[test]
    fn test_condition_forms() {
        let b: Condition = serde_yaml::from_str("true").unwrap();
        assert!(matches!(b, Condition::Bool(true)));
        let e: Condition = serde_yaml::from_str("'branch == main'").unwrap();
        assert!(matches!(e, Condition::Expression(_)));
    }

    #[test]
    fn test_pipelines_source_static_parse() {
        let yaml = r#"
- name: ci
  triggers:
    - type: push
  jobs:
    - name: build
      runner:
        image: rust:1.81
      steps:
        - name: compile
          type: run
          command: cargo build
"#;
        let source: PipelinesSource = serde_yaml::from_str(yaml).unwrap();
        match source {
            PipelinesSource::Static(ref p) => {
                assert_eq!(p.len(), 1);
                assert_eq!(p[0].name, "ci");
                assert_eq!(p[0].jobs[0].runner.image, "rust:1.81");
            }
            _ => panic!("expected static pipelines"),
        }
    }
}
