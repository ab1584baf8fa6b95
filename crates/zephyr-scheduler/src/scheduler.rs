//! Job scheduler: converts pending work in the store into executed jobs
//! under a global concurrency cap, at-least-once.
//!
//! A job stays `Pending` until an atomic compare-and-set claims it; losing
//! that race is not an error, the loop simply re-polls. A crash between
//! the claim and the final status leaves the job `Running` forever, which
//! `reconcile` settles at the next startup.

use crate::dag::JobDag;
use crate::observer::{JobEvent, ObserverBus};
use crate::planner::{matches_trigger, plan, resolve_pipelines, PlannedJob};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zephyr_core::context::TriggerContext;
use zephyr_core::ids::{JobId, RunId};
use zephyr_core::metrics::MetricsSink;
use zephyr_core::pipeline::{PipelineDefinition, ProjectConfig, RunnerKind};
use zephyr_core::ports::{LogSink, Store};
use zephyr_core::run::{Job, JobStatus, LogStream, PipelineRun, Project, RunStatus};
use zephyr_core::{Error, Result};
use zephyr_runner::{
    ExecutionTarget, ExecutorConfig, JobRequest, StepExecutor, StepStatus, VmPool,
};

/// Source of project configurations, keyed by project.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn load(&self, project: &Project) -> Result<ProjectConfig>;
}

/// Fixed in-memory configuration source, used by tests and the in-process
/// CLI runner.
#[derive(Default)]
pub struct StaticConfigLoader {
    configs: std::sync::RwLock<HashMap<zephyr_core::ids::ProjectId, ProjectConfig>>,
}

impl StaticConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project_id: zephyr_core::ids::ProjectId, config: ProjectConfig) {
        self.configs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(project_id, config);
    }
}

#[async_trait]
impl ConfigLoader for StaticConfigLoader {
    async fn load(&self, project: &Project) -> Result<ProjectConfig> {
        self.configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&project.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("config for project {}", project.id)))
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    /// Per-job working directories live under here.
    pub workspace_root: PathBuf,
    /// Secrets made available to `${{ secrets.* }}` placeholders.
    pub secrets: HashMap<String, String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval: Duration::from_secs(2),
            workspace_root: PathBuf::from("/var/lib/zephyr/workspaces"),
            secrets: HashMap::new(),
        }
    }
}

/// Snapshot served by `GET /health`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_jobs: usize,
    pub max_concurrent: usize,
    pub queue_stats: HashMap<String, u64>,
}

/// The long-lived driver.
pub struct JobScheduler {
    store: Arc<dyn Store>,
    configs: Arc<dyn ConfigLoader>,
    pool: Option<Arc<VmPool>>,
    observer: Arc<ObserverBus>,
    metrics: Arc<dyn MetricsSink>,
    config: SchedulerConfig,
    running: AtomicBool,
    notify: Notify,
    active: Mutex<HashMap<JobId, JoinHandle<()>>>,
    cancel_tokens: Mutex<HashMap<JobId, CancellationToken>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

/// Log sink that persists lines and forwards the delta to observers.
struct PublishingLogSink {
    store: Arc<dyn Store>,
    observer: Arc<ObserverBus>,
}

#[async_trait]
impl LogSink for PublishingLogSink {
    async fn append(&self, job_id: &JobId, stream: LogStream, content: &str) -> Result<u64> {
        let seq = self.store.append_log(job_id, stream, content).await?;
        let record = zephyr_core::run::LogRecord {
            job_id: job_id.clone(),
            seq,
            stream,
            timestamp: Utc::now(),
            content: content.to_string(),
        };
        self.observer
            .publish(JobEvent::with_logs(
                job_id.to_string(),
                JobStatus::Running,
                vec![record],
            ))
            .await;
        Ok(seq)
    }
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        configs: Arc<dyn ConfigLoader>,
        pool: Option<Arc<VmPool>>,
        observer: Arc<ObserverBus>,
        metrics: Arc<dyn MetricsSink>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            configs,
            pool,
            observer,
            metrics,
            config,
            running: AtomicBool::new(false),
            notify: Notify::new(),
            active: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            loop_task: Mutex::new(None),
        })
    }

    pub async fn status(&self) -> SchedulerStatus {
        let queue_stats = self
            .store
            .count_jobs_by_status()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();
        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            active_jobs: self.active.lock().await.len(),
            max_concurrent: self.config.max_concurrent,
            queue_stats,
        }
    }

    /// Settle jobs orphaned by a previous process: anything still
    /// `Running` has no live driver and is marked failed.
    pub async fn reconcile(&self) -> Result<()> {
        let orphans = self.store.get_running_jobs().await?;
        for job in orphans {
            warn!(job_id = %job.id, "Reconciling job orphaned by restart");
            self.store
                .set_job_outputs(&job.id, &job.outputs, Some("orphaned by restart"))
                .await?;
            if let Err(e) = self
                .store
                .update_job_status(&job.id, JobStatus::Running, JobStatus::Failure)
                .await
            {
                debug!(job_id = %job.id, error = %e, "Orphan already settled");
                continue;
            }
            self.propagate_completion(&job.pipeline_run_id, &job.name, false)
                .await?;
            self.settle_run(&job.pipeline_run_id).await?;
        }
        Ok(())
    }

    /// Start the poll-driven driver loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = scheduler.notify.notified() => {}
                }
                if !scheduler.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = scheduler.tick().await {
                    // Unrecoverable driver errors are logged; the loop
                    // continues on the next tick.
                    error!(error = %e, "Scheduler tick failed");
                }
            }
        });
        *self.loop_task.lock().await = Some(task);
        info!(max_concurrent = self.config.max_concurrent, "Scheduler started");
    }

    /// Stop the loop and wait for every active job future.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_one();
        if let Some(task) = self.loop_task.lock().await.take() {
            let _ = task.await;
        }
        loop {
            let handle = {
                let mut active = self.active.lock().await;
                let key = active.keys().next().cloned();
                key.and_then(|k| active.remove(&k))
            };
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
        info!("Scheduler stopped");
    }

    /// Enqueue a pipeline run: plan first (nothing is persisted when the
    /// configuration is invalid or cyclic), then persist the run and one
    /// job row per expanded instance.
    pub async fn queue_pipeline_run(
        &self,
        project: &Project,
        pipeline_name: &str,
        ctx: &TriggerContext,
    ) -> Result<RunId> {
        let config = self.configs.load(project).await?;
        let pipelines = resolve_pipelines(&config.pipelines, ctx);
        let pipeline = pipelines
            .iter()
            .find(|p| p.name == pipeline_name)
            .ok_or_else(|| Error::NotFound(format!("pipeline '{pipeline_name}'")))?;

        let plan = plan(pipeline, ctx)?;

        let run = PipelineRun {
            id: RunId::new(),
            project_id: project.id,
            pipeline_name: pipeline.name.clone(),
            trigger_type: ctx.event_type,
            trigger_data: serde_json::to_value(ctx)?,
            branch: ctx.branch.clone(),
            commit_sha: ctx.commit_sha.clone(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.store.create_pipeline_run(&run).await?;

        for planned in &plan.jobs {
            let job = Job {
                id: JobId::new(run.id, &planned.expanded.instance_id),
                pipeline_run_id: run.id,
                name: planned.expanded.instance_id.clone(),
                runner_image: planned.expanded.definition.runner.image.clone(),
                depends_on: planned.depends_on.clone(),
                status: JobStatus::Pending,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                outputs: HashMap::new(),
                failure_reason: None,
            };
            self.store.create_job(&job).await?;
        }

        self.metrics.incr_counter(
            "runs_queued_total",
            &[("pipeline", &pipeline.name)],
            1,
        );
        info!(run_id = %run.id, pipeline = %pipeline.name, jobs = plan.jobs.len(), "Pipeline run queued");
        self.notify.notify_one();
        Ok(run.id)
    }

    /// Enqueue a run for every pipeline in the project that reacts to the
    /// trigger.
    pub async fn handle_trigger(
        &self,
        project: &Project,
        ctx: &TriggerContext,
    ) -> Result<Vec<RunId>> {
        let config = self.configs.load(project).await?;
        let pipelines = resolve_pipelines(&config.pipelines, ctx);
        let mut run_ids = Vec::new();
        for pipeline in &pipelines {
            if matches_trigger(pipeline, ctx) {
                run_ids.push(self.queue_pipeline_run(project, &pipeline.name, ctx).await?);
            }
        }
        Ok(run_ids)
    }

    /// Cancel a run: waiting jobs flip to `Cancelled` in the store, active
    /// executors get their cancellation signal.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        let jobs = self.store.get_jobs_for_pipeline_run(run_id).await?;
        if jobs.is_empty() {
            return Err(Error::NotFound(format!("run {run_id}")));
        }

        let mut any_running = false;
        for job in &jobs {
            match job.status {
                JobStatus::Pending | JobStatus::Ready => {
                    if self
                        .store
                        .update_job_status(&job.id, job.status, JobStatus::Cancelled)
                        .await
                        .is_ok()
                    {
                        self.observer
                            .publish(JobEvent::status_only(
                                job.id.to_string(),
                                JobStatus::Cancelled,
                            ))
                            .await;
                    }
                }
                JobStatus::Running => {
                    any_running = true;
                    if let Some(token) = self.cancel_tokens.lock().await.get(&job.id) {
                        token.cancel();
                    }
                }
                _ => {}
            }
        }

        if !any_running {
            self.settle_run(run_id).await?;
        }
        Ok(())
    }

    /// One driver iteration.
    async fn tick(self: &Arc<Self>) -> Result<()> {
        let counts = self.store.count_jobs_by_status().await?;
        let pending = counts.get(&JobStatus::Pending).copied().unwrap_or(0);
        self.metrics.set_gauge("queue_depth", &[], pending as f64);

        let free = {
            let active = self.active.lock().await;
            self.config.max_concurrent.saturating_sub(active.len())
        };
        if free == 0 {
            return Ok(());
        }

        let candidates = self.store.get_pending_jobs(free as u32).await?;
        for job in candidates {
            let siblings = self
                .store
                .get_jobs_for_pipeline_run(&job.pipeline_run_id)
                .await?;
            let dag = match JobDag::from_jobs(&siblings) {
                Ok(dag) => dag,
                Err(e) => {
                    error!(run_id = %job.pipeline_run_id, error = %e, "Stored run no longer forms a DAG");
                    continue;
                }
            };
            if !dag.is_ready(&job.name) {
                continue;
            }

            match self
                .store
                .update_job_status(&job.id, JobStatus::Pending, JobStatus::Running)
                .await
            {
                Ok(()) => {}
                Err(Error::StoreConflict(_)) => continue, // lost the claim race
                Err(e) => return Err(e),
            }

            if let Ok(Some(run)) = self.store.get_pipeline_run(&job.pipeline_run_id).await {
                if run.status == RunStatus::Pending {
                    let _ = self
                        .store
                        .update_run_status(&job.pipeline_run_id, RunStatus::Running)
                        .await;
                }
            }

            let waited = (Utc::now() - job.created_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
            self.metrics
                .observe_histogram("job_queue_wait_seconds", &[], waited);
            self.observer
                .publish(JobEvent::status_only(job.id.to_string(), JobStatus::Running))
                .await;

            let token = CancellationToken::new();
            self.cancel_tokens
                .lock()
                .await
                .insert(job.id.clone(), token.clone());

            // Hold the map lock across the spawn so the task's own removal
            // cannot run before its handle is registered.
            let mut active = self.active.lock().await;
            let scheduler = Arc::clone(self);
            let registered_id = job.id.clone();
            let task_id = job.id.clone();
            let handle = tokio::spawn(async move {
                scheduler.execute_job(job, token).await;
                scheduler.active.lock().await.remove(&task_id);
                scheduler.cancel_tokens.lock().await.remove(&task_id);
                scheduler.notify.notify_one();
            });
            active.insert(registered_id, handle);
            let at_capacity = active.len() >= self.config.max_concurrent;
            drop(active);
            if at_capacity {
                break;
            }
        }
        Ok(())
    }

    /// Run one claimed job to a terminal state and write everything back.
    async fn execute_job(self: &Arc<Self>, job: Job, cancel: CancellationToken) {
        let outcome = self.execute_job_inner(&job, &cancel).await;

        let final_status = match outcome {
            Ok(status) => status,
            Err(Error::PoolExhausted { .. }) => {
                // Back off: give the claim back and let the next tick retry.
                debug!(job_id = %job.id, "Pool exhausted, requeueing job");
                self.metrics.incr_counter("pool_exhausted_total", &[], 1);
                let _ = self
                    .store
                    .update_job_status(&job.id, JobStatus::Running, JobStatus::Pending)
                    .await;
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job execution failed");
                let _ = self
                    .store
                    .set_job_outputs(&job.id, &HashMap::new(), Some(&e.to_string()))
                    .await;
                JobStatus::Failure
            }
        };

        if let Err(e) = self
            .store
            .update_job_status(&job.id, JobStatus::Running, final_status)
            .await
        {
            warn!(job_id = %job.id, error = %e, "Final status transition lost");
        }

        self.metrics.incr_counter(
            "jobs_completed_total",
            &[("status", final_status.as_str())],
            1,
        );

        self.observer
            .publish(JobEvent::status_only(job.id.to_string(), final_status))
            .await;

        let success = final_status == JobStatus::Success;
        if let Err(e) = self
            .propagate_completion(&job.pipeline_run_id, &job.name, success)
            .await
        {
            error!(run_id = %job.pipeline_run_id, error = %e, "Skip propagation failed");
        }
        if let Err(e) = self.settle_run(&job.pipeline_run_id).await {
            error!(run_id = %job.pipeline_run_id, error = %e, "Run settlement failed");
        }
        self.notify.notify_one();
    }

    async fn execute_job_inner(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<JobStatus> {
        let run = self
            .store
            .get_pipeline_run(&job.pipeline_run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {}", job.pipeline_run_id)))?;
        let project = self
            .store
            .get_project(&run.project_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {}", run.project_id)))?;
        let config = self.configs.load(&project).await?;

        let ctx = TriggerContext {
            event_type: run.trigger_type,
            branch: run.branch.clone(),
            commit_sha: run.commit_sha.clone(),
            repository: None,
            actor: None,
            payload: run.trigger_data.clone(),
        };

        let pipelines = resolve_pipelines(&config.pipelines, &ctx);
        let pipeline = pipelines
            .iter()
            .find(|p| p.name == run.pipeline_name)
            .ok_or_else(|| Error::NotFound(format!("pipeline '{}'", run.pipeline_name)))?;
        let planned = self.locate_planned(pipeline, &ctx, &job.name)?;

        // Collect dependency outputs and statuses.
        let siblings = self
            .store
            .get_jobs_for_pipeline_run(&job.pipeline_run_id)
            .await?;
        let mut needs_outputs = HashMap::new();
        let mut needs_status = HashMap::new();
        for dep_name in &planned.depends_on {
            if let Some(dep) = siblings.iter().find(|j| &j.name == dep_name) {
                needs_status.insert(dep_name.clone(), dep.status.as_str().to_string());
                for (key, value) in &dep.outputs {
                    needs_outputs.insert(format!("{dep_name}.{key}"), value.clone());
                }
            }
        }

        // Pick the execution target.
        let wants_vm = planned.expanded.definition.runner.kind == RunnerKind::MicroVm;
        let lease = match (&self.pool, wants_vm) {
            (Some(pool), true) => Some(pool.acquire().await?),
            _ => None,
        };
        let target = match &lease {
            Some(vm) => ExecutionTarget::MicroVm(vm.handle()),
            None => ExecutionTarget::Local,
        };

        let sink: Arc<dyn LogSink> = Arc::new(PublishingLogSink {
            store: self.store.clone(),
            observer: self.observer.clone(),
        });
        let executor = StepExecutor::new(
            ExecutorConfig {
                toolchain_root: self.config.workspace_root.join("toolchains"),
                kill_grace: Duration::from_secs(5),
            },
            sink,
        );

        let request = JobRequest {
            job_id: job.id.clone(),
            definition: planned.expanded.definition.clone(),
            workdir: self
                .config
                .workspace_root
                .join(run.id.to_string())
                .join(&planned.expanded.instance_id),
            target,
            secrets: self.config.secrets.clone(),
            needs_outputs,
            needs_status,
            branch: run.branch.clone(),
            event_type: Some(run.trigger_type.as_str().to_string()),
        };

        let report = executor.execute(&request, cancel).await;

        if let Some(vm) = lease {
            if let Some(pool) = &self.pool {
                let destroy = report.is_err();
                if let Err(e) = pool.release(&vm.id, destroy).await {
                    warn!(vm_id = %vm.id, error = %e, "VM release failed");
                }
            }
        }

        let report = report?;
        for step in &report.steps {
            self.metrics.incr_counter(
                "steps_completed_total",
                &[("status", step_status_label(step.status))],
                1,
            );
        }
        self.store
            .set_job_outputs(&job.id, &report.outputs, report.failure_reason.as_deref())
            .await?;

        Ok(report.status)
    }

    fn locate_planned(
        &self,
        pipeline: &PipelineDefinition,
        ctx: &TriggerContext,
        instance_id: &str,
    ) -> Result<PlannedJob> {
        let plan = plan(pipeline, ctx)?;
        plan.jobs
            .into_iter()
            .find(|j| j.expanded.instance_id == instance_id)
            .ok_or_else(|| Error::NotFound(format!("job instance '{instance_id}'")))
    }

    /// Push the completion through the run's DAG: on failure, persist the
    /// skip closure.
    async fn propagate_completion(
        &self,
        run_id: &RunId,
        job_name: &str,
        success: bool,
    ) -> Result<()> {
        if success {
            return Ok(());
        }
        let jobs = self.store.get_jobs_for_pipeline_run(run_id).await?;
        let mut dag = JobDag::from_jobs(&jobs)?;
        let _ = dag.mark_completed(job_name, false)?;

        for job in &jobs {
            if job.status == JobStatus::Pending && dag.status(&job.name) == Some(JobStatus::Skipped)
            {
                match self
                    .store
                    .update_job_status(&job.id, JobStatus::Pending, JobStatus::Skipped)
                    .await
                {
                    Ok(()) => {
                        self.observer
                            .publish(JobEvent::status_only(
                                job.id.to_string(),
                                JobStatus::Skipped,
                            ))
                            .await;
                    }
                    Err(Error::StoreConflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// When every job is terminal, give the run its terminal status.
    async fn settle_run(&self, run_id: &RunId) -> Result<()> {
        let jobs = self.store.get_jobs_for_pipeline_run(run_id).await?;
        if jobs.is_empty() || !jobs.iter().all(|j| j.status.is_terminal()) {
            return Ok(());
        }
        let status = if jobs.iter().any(|j| j.status == JobStatus::Failure) {
            RunStatus::Failure
        } else if jobs.iter().any(|j| j.status == JobStatus::Cancelled) {
            RunStatus::Cancelled
        } else {
            RunStatus::Success
        };

        if let Some(run) = self.store.get_pipeline_run(run_id).await? {
            if !run.status.is_terminal() {
                self.store.update_run_status(run_id, status).await?;
                self.metrics.incr_counter(
                    "runs_completed_total",
                    &[("status", status.as_str())],
                    1,
                );
                info!(run_id = %run_id, status = status.as_str(), "Run settled");
            }
        }
        Ok(())
    }
}

fn step_status_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Success => "success",
        StepStatus::Failure => "failure",
        StepStatus::Skipped => "skipped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use zephyr_core::metrics::NoopMetrics;
    use zephyr_core::pipeline::{
        JobDefinition, PipelinesSource, ProjectMeta, RunnerSpec, StepDefinition, StepKind,
        TriggerConfig, TriggerType,
    };
    use zephyr_store::MemoryStore;

    fn step(name: &str, command: &str) -> StepDefinition {
        StepDefinition {
            id: None,
            name: name.to_string(),
            kind: StepKind::Run {
                command: command.to_string(),
            },
            env: HashMap::new(),
            workdir: None,
            shell: "bash".to_string(),
            condition: None,
            continue_on_error: false,
            timeout_seconds: None,
        }
    }

    fn local_job(name: &str, deps: Vec<&str>, command: &str) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            runner: RunnerSpec {
                image: "ubuntu:24.04".to_string(),
                kind: RunnerKind::Local,
            },
            depends_on: deps.into_iter().map(String::from).collect(),
            env: HashMap::new(),
            steps: vec![step("main", command)],
            matrix: None,
        }
    }

    fn pipeline(name: &str, jobs: Vec<JobDefinition>) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            triggers: vec![TriggerConfig {
                trigger_type: TriggerType::Api,
                branches: vec![],
            }],
            env: HashMap::new(),
            jobs,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        scheduler: Arc<JobScheduler>,
        project: Project,
        _workspace: tempfile::TempDir,
    }

    async fn harness(pipelines: Vec<PipelineDefinition>, max_concurrent: usize) -> Harness {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let project = Project {
            id: zephyr_core::ids::ProjectId::new(),
            name: "demo".to_string(),
            description: None,
            config_path: "zephyr.yaml".to_string(),
        };
        store.create_project(&project).await.unwrap();
        let configs = StaticConfigLoader::new();
        configs.insert(
            project.id,
            ProjectConfig {
                project: ProjectMeta {
                    name: "demo".to_string(),
                    description: None,
                },
                pipelines: PipelinesSource::Static(pipelines),
            },
        );

        let workspace = tempfile::tempdir().unwrap();
        let scheduler = JobScheduler::new(
            store.clone(),
            Arc::new(configs),
            None,
            Arc::new(ObserverBus::default()),
            Arc::new(NoopMetrics),
            SchedulerConfig {
                max_concurrent,
                poll_interval: Duration::from_millis(50),
                workspace_root: workspace.path().to_path_buf(),
                secrets: HashMap::new(),
            },
        );
        Harness {
            store,
            scheduler,
            project,
            _workspace: workspace,
        }
    }

    async fn wait_until<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn job_by_name(store: &MemoryStore, run_id: &RunId, name: &str) -> Job {
        store
            .get_jobs_for_pipeline_run(run_id)
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.name == name)
            .unwrap()
    }

    #[tokio::test]
    async fn test_queue_persists_run_and_expanded_jobs() {
        let h = harness(
            vec![pipeline(
                "ci",
                vec![
                    local_job("build", vec![], "echo build"),
                    local_job("test", vec!["build"], "echo test"),
                ],
            )],
            2,
        ).await;
        let ctx = TriggerContext::new(TriggerType::Api).with_branch("main");
        let run_id = h
            .scheduler
            .queue_pipeline_run(&h.project, "ci", &ctx)
            .await
            .unwrap();

        let run = h.store.get_pipeline_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        let jobs = h.store.get_jobs_for_pipeline_run(&run_id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        let test = jobs.iter().find(|j| j.name == "test").unwrap();
        assert_eq!(test.depends_on, vec!["build"]);
    }

    #[tokio::test]
    async fn test_invalid_pipeline_persists_nothing() {
        let mut bad = local_job("build", vec![], "echo hi");
        bad.steps.clear();
        let h = harness(vec![pipeline("ci", vec![bad])], 2).await;

        let err = h
            .scheduler
            .queue_pipeline_run(&h.project, "ci", &TriggerContext::new(TriggerType::Api))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let runs = h
            .store
            .list_pipeline_runs(&Default::default())
            .await
            .unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn test_linear_run_succeeds_in_order() {
        let h = harness(
            vec![pipeline(
                "ci",
                vec![
                    local_job("a", vec![], "echo a"),
                    local_job("b", vec!["a"], "echo b"),
                    local_job("c", vec!["b"], "echo c"),
                ],
            )],
            4,
        ).await;
        let run_id = h
            .scheduler
            .queue_pipeline_run(&h.project, "ci", &TriggerContext::new(TriggerType::Api))
            .await
            .unwrap();
        h.scheduler.start().await;

        let store = h.store.clone();
        assert!(
            wait_until(|| {
                let store = store.clone();
                async move {
                    store
                        .get_pipeline_run(&run_id)
                        .await
                        .unwrap()
                        .unwrap()
                        .status
                        .is_terminal()
                }
            })
            .await
        );
        h.scheduler.stop().await;

        let run = h.store.get_pipeline_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);

        let a = job_by_name(&h.store, &run_id, "a").await;
        let b = job_by_name(&h.store, &run_id, "b").await;
        let c = job_by_name(&h.store, &run_id, "c").await;
        for job in [&a, &b, &c] {
            assert_eq!(job.status, JobStatus::Success);
        }
        assert!(b.started_at.unwrap() >= a.finished_at.unwrap());
        assert!(c.started_at.unwrap() >= b.finished_at.unwrap());
    }

    #[tokio::test]
    async fn test_diamond_with_failure_skips_join() {
        let h = harness(
            vec![pipeline(
                "ci",
                vec![
                    local_job("a", vec![], "echo a"),
                    local_job("b", vec!["a"], "exit 1"),
                    local_job("c", vec!["a"], "echo c"),
                    local_job("d", vec!["b", "c"], "echo d"),
                ],
            )],
            4,
        ).await;
        let run_id = h
            .scheduler
            .queue_pipeline_run(&h.project, "ci", &TriggerContext::new(TriggerType::Api))
            .await
            .unwrap();
        h.scheduler.start().await;

        let store = h.store.clone();
        assert!(
            wait_until(|| {
                let store = store.clone();
                async move {
                    store
                        .get_pipeline_run(&run_id)
                        .await
                        .unwrap()
                        .unwrap()
                        .status
                        .is_terminal()
                }
            })
            .await
        );
        h.scheduler.stop().await;

        assert_eq!(
            h.store
                .get_pipeline_run(&run_id)
                .await
                .unwrap()
                .unwrap()
                .status,
            RunStatus::Failure
        );
        assert_eq!(job_by_name(&h.store, &run_id, "a").await.status, JobStatus::Success);
        let b = job_by_name(&h.store, &run_id, "b").await;
        assert_eq!(b.status, JobStatus::Failure);
        assert!(b.failure_reason.as_deref().unwrap().contains("exit code 1"));
        assert_eq!(job_by_name(&h.store, &run_id, "c").await.status, JobStatus::Success);
        assert_eq!(job_by_name(&h.store, &run_id, "d").await.status, JobStatus::Skipped);
    }

    #[tokio::test]
    async fn test_concurrency_cap_serialises_independent_jobs() {
        let h = harness(
            vec![pipeline(
                "ci",
                vec![
                    local_job("one", vec![], "sleep 0.3"),
                    local_job("two", vec![], "sleep 0.3"),
                ],
            )],
            1,
        ).await;
        let run_id = h
            .scheduler
            .queue_pipeline_run(&h.project, "ci", &TriggerContext::new(TriggerType::Api))
            .await
            .unwrap();
        h.scheduler.start().await;

        let store = h.store.clone();
        assert!(
            wait_until(|| {
                let store = store.clone();
                async move {
                    store
                        .get_pipeline_run(&run_id)
                        .await
                        .unwrap()
                        .unwrap()
                        .status
                        .is_terminal()
                }
            })
            .await
        );
        h.scheduler.stop().await;

        let one = job_by_name(&h.store, &run_id, "one").await;
        let two = job_by_name(&h.store, &run_id, "two").await;
        let (first, second) = if one.started_at.unwrap() <= two.started_at.unwrap() {
            (one, two)
        } else {
            (two, one)
        };
        // With a cap of one, the second may only start after the first
        // finished.
        assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_run_settles_everything() {
        let h = harness(
            vec![pipeline(
                "ci",
                vec![
                    local_job("long", vec![], "sleep 30"),
                    local_job("after", vec!["long"], "echo nope"),
                ],
            )],
            2,
        ).await;
        let run_id = h
            .scheduler
            .queue_pipeline_run(&h.project, "ci", &TriggerContext::new(TriggerType::Api))
            .await
            .unwrap();
        h.scheduler.start().await;

        let store = h.store.clone();
        assert!(
            wait_until(|| {
                let store = store.clone();
                async move {
                    store
                        .get_jobs_for_pipeline_run(&run_id)
                        .await
                        .unwrap()
                        .iter()
                        .any(|j| j.status == JobStatus::Running)
                }
            })
            .await
        );

        h.scheduler.cancel_run(&run_id).await.unwrap();

        let store = h.store.clone();
        assert!(
            wait_until(|| {
                let store = store.clone();
                async move {
                    store
                        .get_pipeline_run(&run_id)
                        .await
                        .unwrap()
                        .unwrap()
                        .status
                        .is_terminal()
                }
            })
            .await
        );
        h.scheduler.stop().await;

        assert_eq!(
            h.store
                .get_pipeline_run(&run_id)
                .await
                .unwrap()
                .unwrap()
                .status,
            RunStatus::Cancelled
        );
        assert_eq!(
            job_by_name(&h.store, &run_id, "long").await.status,
            JobStatus::Cancelled
        );
        assert_eq!(
            job_by_name(&h.store, &run_id, "after").await.status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_reconcile_fails_orphaned_running_jobs() {
        let h = harness(vec![pipeline("ci", vec![local_job("a", vec![], "echo a")])], 2).await;

        let run = PipelineRun {
            id: RunId::new(),
            project_id: h.project.id,
            pipeline_name: "ci".to_string(),
            trigger_type: TriggerType::Api,
            trigger_data: serde_json::Value::Null,
            branch: None,
            commit_sha: None,
            status: RunStatus::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
        };
        h.store.create_pipeline_run(&run).await.unwrap();
        let orphan = Job {
            id: JobId::new(run.id, "a"),
            pipeline_run_id: run.id,
            name: "a".to_string(),
            runner_image: "ubuntu:24.04".to_string(),
            depends_on: vec![],
            status: JobStatus::Running,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
            outputs: HashMap::new(),
            failure_reason: None,
        };
        h.store.create_job(&orphan).await.unwrap();

        h.scheduler.reconcile().await.unwrap();

        let settled = h.store.get_job(&orphan.id).await.unwrap().unwrap();
        assert_eq!(settled.status, JobStatus::Failure);
        assert_eq!(settled.failure_reason.as_deref(), Some("orphaned by restart"));
        assert_eq!(
            h.store
                .get_pipeline_run(&run.id)
                .await
                .unwrap()
                .unwrap()
                .status,
            RunStatus::Failure
        );
    }

    #[tokio::test]
    async fn test_step_outputs_surface_on_job_row() {
        let h = harness(
            vec![pipeline(
                "ci",
                vec![local_job(
                    "emit",
                    vec![],
                    "echo '::set-output name=version::1.2.3'",
                )],
            )],
            2,
        ).await;
        let run_id = h
            .scheduler
            .queue_pipeline_run(&h.project, "ci", &TriggerContext::new(TriggerType::Api))
            .await
            .unwrap();
        h.scheduler.start().await;

        let store = h.store.clone();
        assert!(
            wait_until(|| {
                let store = store.clone();
                async move {
                    store
                        .get_pipeline_run(&run_id)
                        .await
                        .unwrap()
                        .unwrap()
                        .status
                        .is_terminal()
                }
            })
            .await
        );
        h.scheduler.stop().await;

        let job = job_by_name(&h.store, &run_id, "emit").await;
        assert_eq!(job.outputs.get("version").map(String::as_str), Some("1.2.3"));

        let logs = h.store.get_logs_for_job(&job.id, None).await.unwrap();
        let seqs: Vec<u64> = logs.iter().map(|l| l.seq).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
    }
}
