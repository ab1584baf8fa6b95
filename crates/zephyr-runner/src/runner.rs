//! Shared execution types.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use zephyr_core::ids::{JobId, VmId};
use zephyr_core::pipeline::JobDefinition;
use zephyr_core::run::JobStatus;

/// Where a job's steps run.
#[derive(Debug, Clone)]
pub enum ExecutionTarget {
    /// The orchestrator host's own shell.
    Local,
    /// An acquired microVM, reached over its guest address.
    MicroVm(VmHandle),
}

/// Handle to an acquired pool VM.
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub id: VmId,
    pub guest_ip: Ipv4Addr,
}

/// Executor-wide configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Root under which setup steps provision toolchains.
    pub toolchain_root: PathBuf,
    /// How long a cancelled process gets between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            toolchain_root: PathBuf::from("/var/lib/zephyr/toolchains"),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Everything the executor needs to run one job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: JobId,
    /// The expanded (matrix-resolved) job definition.
    pub definition: JobDefinition,
    pub workdir: PathBuf,
    pub target: ExecutionTarget,
    pub secrets: HashMap<String, String>,
    /// Dependency outputs: `"job_name.output_key"` -> value.
    pub needs_outputs: HashMap<String, String>,
    /// Dependency statuses: job name -> status string.
    pub needs_status: HashMap<String, String>,
    pub branch: Option<String>,
    pub event_type: Option<String>,
}

/// Outcome of a step that actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failure,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::Failure => "failure",
        }
    }
}

/// Reported status of a step; diverges from the outcome only for failed
/// steps marked `continue_on_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    pub outcome: Option<StepOutcome>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub outputs: HashMap<String, String>,
}

impl StepReport {
    pub fn skipped(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: StepStatus::Skipped,
            outcome: None,
            exit_code: None,
            duration_ms: 0,
            outputs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub status: JobStatus,
    pub steps: Vec<StepReport>,
    /// Flattened step outputs, addressable by dependents as
    /// `needs.<job>.outputs.<name>`.
    pub outputs: HashMap<String, String>,
    pub failure_reason: Option<String>,
}
