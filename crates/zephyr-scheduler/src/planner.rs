//! Pipeline planner: pure transformation from a validated configuration
//! plus a trigger context to concrete job instances and their dependency
//! edges.

use crate::dag::{JobDag, JobNode};
use crate::matrix::{expand_matrix, ExpandedJob};
use std::collections::{HashMap, HashSet};
use zephyr_core::context::TriggerContext;
use zephyr_core::pipeline::{PipelineDefinition, PipelinesSource};
use zephyr_core::{Error, Result};

/// A planned job instance with its dependencies rewritten onto concrete
/// instance ids.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub expanded: ExpandedJob,
    /// Instance ids of every dependency; a dependency on a matrix job
    /// expands to all of its instances.
    pub depends_on: Vec<String>,
}

/// The concrete plan for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub pipeline_name: String,
    pub jobs: Vec<PlannedJob>,
}

/// Resolve the pipeline list for a trigger. Static lists pass through
/// unchanged; dynamic sources are evaluated once with the context.
pub fn resolve_pipelines(
    source: &PipelinesSource,
    ctx: &TriggerContext,
) -> Vec<PipelineDefinition> {
    match source {
        PipelinesSource::Static(pipelines) => pipelines.clone(),
        PipelinesSource::Dynamic(f) => f(ctx),
    }
}

/// Validate one pipeline definition.
pub fn validate_pipeline(pipeline: &PipelineDefinition) -> Result<()> {
    if pipeline.name.trim().is_empty() {
        return Err(Error::InvalidConfig("pipeline name is empty".into()));
    }
    if pipeline.triggers.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "pipeline '{}' has no triggers",
            pipeline.name
        )));
    }
    if pipeline.jobs.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "pipeline '{}' has no jobs",
            pipeline.name
        )));
    }

    let mut seen = HashSet::new();
    for job in &pipeline.jobs {
        if !seen.insert(job.name.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "duplicate job name '{}' in pipeline '{}'",
                job.name, pipeline.name
            )));
        }
    }

    let names: HashSet<&str> = pipeline.jobs.iter().map(|j| j.name.as_str()).collect();
    for job in &pipeline.jobs {
        for dep in &job.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "job '{}' depends on unknown job '{}'",
                    job.name, dep
                )));
            }
        }
        if job.runner.image.trim().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "job '{}' has a runner without an image",
                job.name
            )));
        }
        if job.steps.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "job '{}' has no steps",
                job.name
            )));
        }
    }

    Ok(())
}

/// Does this pipeline react to the given trigger?
///
/// A trigger entry matches when its type equals the event type and, if it
/// carries branch filters, one of them matches the event branch (exact, or
/// prefix up to a trailing `*`).
pub fn matches_trigger(pipeline: &PipelineDefinition, ctx: &TriggerContext) -> bool {
    pipeline.triggers.iter().any(|trigger| {
        if trigger.trigger_type != ctx.event_type {
            return false;
        }
        if trigger.branches.is_empty() {
            return true;
        }
        let branch = match &ctx.branch {
            Some(b) => b.as_str(),
            None => return false,
        };
        trigger.branches.iter().any(|pattern| {
            match pattern.strip_suffix('*') {
                Some(prefix) => branch.starts_with(prefix),
                None => branch == pattern,
            }
        })
    })
}

/// Expand a validated pipeline into its concrete job instances.
///
/// Fails with `InvalidConfig` or `CyclicDependency` before anything is
/// persisted; the resulting plan is guaranteed to build into a valid DAG.
pub fn plan(pipeline: &PipelineDefinition, _ctx: &TriggerContext) -> Result<PipelinePlan> {
    validate_pipeline(pipeline)?;

    let mut instances_of: HashMap<String, Vec<String>> = HashMap::new();
    let mut planned = Vec::new();

    for job in &pipeline.jobs {
        let mut job = job.clone();
        // Pipeline-level env is the base layer; job env overrides.
        for (key, value) in &pipeline.env {
            job.env.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let expanded = expand_matrix(&job);
        instances_of.insert(
            job.name.clone(),
            expanded.iter().map(|e| e.instance_id.clone()).collect(),
        );
        for instance in expanded {
            planned.push((job.depends_on.clone(), instance));
        }
    }

    let jobs: Vec<PlannedJob> = planned
        .into_iter()
        .map(|(logical_deps, expanded)| {
            let depends_on = logical_deps
                .iter()
                .flat_map(|dep| instances_of.get(dep).cloned().unwrap_or_default())
                .collect();
            PlannedJob {
                expanded,
                depends_on,
            }
        })
        .collect();

    // Reject cycles before the caller persists anything.
    JobDag::build(
        jobs.iter()
            .map(|j| JobNode::new(j.expanded.instance_id.clone(), j.depends_on.clone()))
            .collect(),
    )?;

    Ok(PipelinePlan {
        pipeline_name: pipeline.name.clone(),
        jobs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use zephyr_core::pipeline::{
        JobDefinition, MatrixConfig, MatrixDimensions, RunnerSpec, StepDefinition, StepKind,
        TriggerConfig, TriggerType,
    };

    fn step(cmd: &str) -> StepDefinition {
        StepDefinition {
            id: None,
            name: "run".to_string(),
            kind: StepKind::Run {
                command: cmd.to_string(),
            },
            env: HashMap::new(),
            workdir: None,
            shell: "bash".to_string(),
            condition: None,
            continue_on_error: false,
            timeout_seconds: None,
        }
    }

    fn job(name: &str, deps: Vec<&str>) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            runner: RunnerSpec {
                image: "ubuntu:24.04".to_string(),
                kind: Default::default(),
            },
            depends_on: deps.into_iter().map(String::from).collect(),
            env: HashMap::new(),
            steps: vec![step("echo hi")],
            matrix: None,
        }
    }

    fn pipeline(jobs: Vec<JobDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            name: "ci".to_string(),
            triggers: vec![TriggerConfig {
                trigger_type: TriggerType::Push,
                branches: vec![],
            }],
            env: HashMap::new(),
            jobs,
        }
    }

    #[test]
    fn test_resolve_static_is_identity() {
        let pipelines = vec![pipeline(vec![job("build", vec![])])];
        let source = PipelinesSource::Static(pipelines.clone());
        let ctx = TriggerContext::new(TriggerType::Push);
        let resolved = resolve_pipelines(&source, &ctx);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, pipelines[0].name);
    }

    #[test]
    fn test_resolve_dynamic_is_evaluated_with_context() {
        let source = PipelinesSource::Dynamic(Arc::new(|ctx: &TriggerContext| {
            if ctx.branch.as_deref() == Some("main") {
                vec![pipeline(vec![job("deploy", vec![])])]
            } else {
                vec![]
            }
        }));
        let on_main = TriggerContext::new(TriggerType::Push).with_branch("main");
        assert_eq!(resolve_pipelines(&source, &on_main).len(), 1);
        let elsewhere = TriggerContext::new(TriggerType::Push).with_branch("dev");
        assert!(resolve_pipelines(&source, &elsewhere).is_empty());
    }

    #[test]
    fn test_validation_failures() {
        let mut p = pipeline(vec![job("build", vec![])]);
        p.name = String::new();
        assert!(validate_pipeline(&p).is_err());

        let mut p = pipeline(vec![job("build", vec![])]);
        p.triggers.clear();
        assert!(validate_pipeline(&p).is_err());

        let p = pipeline(vec![]);
        assert!(validate_pipeline(&p).is_err());

        let p = pipeline(vec![job("build", vec![]), job("build", vec![])]);
        assert!(validate_pipeline(&p).is_err());

        let p = pipeline(vec![job("build", vec!["ghost"])]);
        assert!(validate_pipeline(&p).is_err());

        let mut bad_runner = job("build", vec![]);
        bad_runner.runner.image = String::new();
        assert!(validate_pipeline(&pipeline(vec![bad_runner])).is_err());

        let mut no_steps = job("build", vec![]);
        no_steps.steps.clear();
        assert!(validate_pipeline(&pipeline(vec![no_steps])).is_err());
    }

    #[test]
    fn test_trigger_matching() {
        let mut p = pipeline(vec![job("build", vec![])]);
        p.triggers = vec![TriggerConfig {
            trigger_type: TriggerType::Push,
            branches: vec!["main".to_string(), "release/*".to_string()],
        }];

        let main = TriggerContext::new(TriggerType::Push).with_branch("main");
        assert!(matches_trigger(&p, &main));
        let release = TriggerContext::new(TriggerType::Push).with_branch("release/1.2");
        assert!(matches_trigger(&p, &release));
        let dev = TriggerContext::new(TriggerType::Push).with_branch("dev");
        assert!(!matches_trigger(&p, &dev));
        let pr = TriggerContext::new(TriggerType::PullRequest).with_branch("main");
        assert!(!matches_trigger(&p, &pr));
    }

    #[test]
    fn test_plan_rewrites_matrix_dependencies() {
        let mut test_job = job("test", vec![]);
        test_job.matrix = Some(MatrixConfig {
            values: MatrixDimensions(vec![(
                "os".to_string(),
                vec!["ubuntu".into(), "alpine".into()],
            )]),
            exclude: vec![],
            include: vec![],
            max_parallel: None,
        });
        let p = pipeline(vec![test_job, job("publish", vec!["test"])]);

        let plan = plan(&p, &TriggerContext::new(TriggerType::Push)).unwrap();
        assert_eq!(plan.jobs.len(), 3);
        let publish = plan
            .jobs
            .iter()
            .find(|j| j.expanded.instance_id == "publish")
            .unwrap();
        assert_eq!(
            publish.depends_on,
            vec!["test-os=ubuntu", "test-os=alpine"]
        );
    }

    #[test]
    fn test_plan_rejects_cycles() {
        let p = pipeline(vec![job("a", vec!["b"]), job("b", vec!["a"])]);
        let err = plan(&p, &TriggerContext::new(TriggerType::Push)).unwrap_err();
        assert!(matches!(err, Error::CyclicDependency(_)));
    }

    #[test]
    fn test_plan_layers_pipeline_env_under_job_env() {
        let mut p = pipeline(vec![job("build", vec![])]);
        p.env.insert("SHARED".to_string(), "from-pipeline".to_string());
        p.env.insert("OVERRIDDEN".to_string(), "pipeline".to_string());
        p.jobs[0]
            .env
            .insert("OVERRIDDEN".to_string(), "job".to_string());

        let plan = plan(&p, &TriggerContext::new(TriggerType::Push)).unwrap();
        let env = &plan.jobs[0].expanded.definition.env;
        assert_eq!(env.get("SHARED").map(String::as_str), Some("from-pipeline"));
        assert_eq!(env.get("OVERRIDDEN").map(String::as_str), Some("job"));
    }
}
