//! In-memory implementation of the `Store` port.
//!
//! Backs tests and the in-process CLI runner. Transition semantics match
//! `SqliteStore`, including the conditional-update CAS.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use zephyr_core::ids::{JobId, ProjectId, RunId};
use zephyr_core::ports::{RunFilter, Store};
use zephyr_core::run::{
    Job, JobStatus, LogRecord, LogStream, PipelineRun, Project, RunStatus, WebhookDelivery,
};
use zephyr_core::{Error, Result};

#[derive(Default)]
struct Inner {
    projects: HashMap<ProjectId, Project>,
    runs: HashMap<RunId, PipelineRun>,
    jobs: HashMap<JobId, Job>,
    logs: HashMap<JobId, Vec<LogRecord>>,
    deliveries: Vec<WebhookDelivery>,
}

/// Map-backed store; everything lives behind one RwLock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_project(&self, project: &Project) -> Result<()> {
        self.inner
            .write()
            .await
            .projects
            .insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        Ok(self.inner.read().await.projects.get(id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> =
            self.inner.read().await.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn create_pipeline_run(&self, run: &PipelineRun) -> Result<()> {
        self.inner.write().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_pipeline_run(&self, id: &RunId) -> Result<Option<PipelineRun>> {
        Ok(self.inner.read().await.runs.get(id).cloned())
    }

    async fn list_pipeline_runs(&self, filter: &RunFilter) -> Result<Vec<PipelineRun>> {
        let inner = self.inner.read().await;
        let mut runs: Vec<PipelineRun> = inner
            .runs
            .values()
            .filter(|r| filter.project_id.map_or(true, |p| r.project_id == p))
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(filter.limit.unwrap_or(50) as usize);
        Ok(runs)
    }

    async fn update_run_status(&self, id: &RunId, status: RunStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let run = inner
            .runs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("run {id}")))?;
        let now = Utc::now();
        run.status = status;
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() && run.finished_at.is_none() {
            run.finished_at = Some(now);
        }
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        self.inner
            .write()
            .await
            .jobs
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::StoreConflict(id.to_string()))?;
        if job.status != expected {
            return Err(Error::StoreConflict(id.to_string()));
        }
        let now = Utc::now();
        job.status = next;
        if next == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if next.is_terminal() && job.finished_at.is_none() {
            job.finished_at = Some(now);
        }
        Ok(())
    }

    async fn set_job_outputs(
        &self,
        id: &JobId,
        outputs: &HashMap<String, String>,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        job.outputs = outputs.clone();
        job.failure_reason = failure_reason.map(String::from);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(id).cloned())
    }

    async fn get_jobs_for_pipeline_run(&self, run_id: &RunId) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.pipeline_run_id == *run_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.as_str().cmp(b.id.as_str())));
        Ok(jobs)
    }

    async fn get_pending_jobs(&self, limit: u32) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.as_str().cmp(b.id.as_str())));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn get_running_jobs(&self) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .cloned()
            .collect())
    }

    async fn count_jobs_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for job in inner.jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn append_log(&self, job_id: &JobId, stream: LogStream, content: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let records = inner.logs.entry(job_id.clone()).or_default();
        let seq = records.last().map(|r| r.seq).unwrap_or(0) + 1;
        records.push(LogRecord {
            job_id: job_id.clone(),
            seq,
            stream,
            timestamp: Utc::now(),
            content: content.to_string(),
        });
        Ok(seq)
    }

    async fn get_logs_for_job(
        &self,
        job_id: &JobId,
        since: Option<u64>,
    ) -> Result<Vec<LogRecord>> {
        let inner = self.inner.read().await;
        let since = since.unwrap_or(0);
        Ok(inner
            .logs
            .get(job_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.seq > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_webhook_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        self.inner.write().await.deliveries.push(delivery.clone());
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_conflict() {
        let store = MemoryStore::new();
        let run_id = RunId::new();
        let job = Job {
            id: JobId::new(run_id, "build"),
            pipeline_run_id: run_id,
            name: "build".to_string(),
            runner_image: "ubuntu:24.04".to_string(),
            depends_on: vec![],
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            outputs: HashMap::new(),
            failure_reason: None,
        };
        store.create_job(&job).await.unwrap();

        store
            .update_job_status(&job.id, JobStatus::Pending, JobStatus::Running)
            .await
            .unwrap();
        let err = store
            .update_job_status(&job.id, JobStatus::Pending, JobStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreConflict(_)));
    }

    #[tokio::test]
    async fn test_log_seq_per_job() {
        let store = MemoryStore::new();
        let a = JobId::new(RunId::new(), "a");
        let b = JobId::new(RunId::new(), "b");
        assert_eq!(store.append_log(&a, LogStream::Stdout, "1").await.unwrap(), 1);
        assert_eq!(store.append_log(&b, LogStream::Stdout, "1").await.unwrap(), 1);
        assert_eq!(store.append_log(&a, LogStream::Stderr, "2").await.unwrap(), 2);
    }
}
