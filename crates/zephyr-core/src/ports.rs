//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external
//! adapters: the persistent store, the job log sink, and the hypervisor
//! control plane.

use crate::ids::{JobId, ProjectId, RunId, VmId};
use crate::run::{Job, JobStatus, LogRecord, LogStream, PipelineRun, Project, RunStatus, WebhookDelivery};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Filters for listing pipeline runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub project_id: Option<ProjectId>,
    pub status: Option<RunStatus>,
    pub limit: Option<u32>,
}

/// The single source of truth for projects, runs, jobs, logs, and webhook
/// deliveries. All status transitions go through it; it serialises them.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_project(&self, project: &Project) -> Result<()>;
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>>;
    async fn list_projects(&self) -> Result<Vec<Project>>;

    async fn create_pipeline_run(&self, run: &PipelineRun) -> Result<()>;
    async fn get_pipeline_run(&self, id: &RunId) -> Result<Option<PipelineRun>>;
    async fn list_pipeline_runs(&self, filter: &RunFilter) -> Result<Vec<PipelineRun>>;
    /// Update a run's status, stamping `started_at` on the transition to
    /// `Running` and `finished_at` on any terminal transition.
    async fn update_run_status(&self, id: &RunId, status: RunStatus) -> Result<()>;

    async fn create_job(&self, job: &Job) -> Result<()>;
    /// Compare-and-set a job's status. Fails with `StoreConflict` when the
    /// stored status does not equal `expected`. Stamps `started_at` /
    /// `finished_at` like `update_run_status`.
    async fn update_job_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<()>;
    /// Attach outputs and an optional failure reason to a job.
    async fn set_job_outputs(
        &self,
        id: &JobId,
        outputs: &HashMap<String, String>,
        failure_reason: Option<&str>,
    ) -> Result<()>;
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;
    async fn get_jobs_for_pipeline_run(&self, run_id: &RunId) -> Result<Vec<Job>>;
    async fn get_pending_jobs(&self, limit: u32) -> Result<Vec<Job>>;
    async fn get_running_jobs(&self) -> Result<Vec<Job>>;
    async fn count_jobs_by_status(&self) -> Result<HashMap<JobStatus, u64>>;

    /// Append one log line; returns the assigned per-job sequence number.
    async fn append_log(&self, job_id: &JobId, stream: LogStream, content: &str) -> Result<u64>;
    async fn get_logs_for_job(&self, job_id: &JobId, since: Option<u64>)
        -> Result<Vec<LogRecord>>;

    async fn save_webhook_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    /// Release the backing resources. The store is unusable afterwards.
    async fn destroy(&self) -> Result<()>;
}

/// Destination for captured job output lines.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append one line; returns the assigned sequence number.
    async fn append(&self, job_id: &JobId, stream: LogStream, content: &str) -> Result<u64>;
}

/// Network attachment of a microVM: TAP device on the host, /30 subnet
/// shared between gateway (host side) and guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmNetwork {
    pub tap_device: String,
    pub guest_mac: String,
    pub guest_ip: std::net::Ipv4Addr,
    pub gateway_ip: std::net::Ipv4Addr,
    /// Index of the /30 block inside the allocator's base network.
    pub index: u32,
}

/// Everything the hypervisor needs to create one microVM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub id: VmId,
    pub kernel: String,
    pub rootfs: String,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub network: VmNetwork,
}

/// Typed driver over the hypervisor control plane.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Create the VM described by `spec` without starting it.
    async fn create(&self, spec: &VmSpec) -> Result<()>;
    /// Boot a previously created VM.
    async fn start(&self, id: &VmId) -> Result<()>;
    /// Tear the VM down and release hypervisor-side resources.
    async fn destroy(&self, id: &VmId) -> Result<()>;
}
