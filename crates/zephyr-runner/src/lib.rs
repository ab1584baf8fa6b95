//! Zephyr CI execution layer.
//!
//! Runs one job's ordered steps to a terminal result, either in a local
//! shell or inside a pre-booted Firecracker microVM drawn from the warm
//! pool.

pub mod executor;
pub mod firecracker;
pub mod network;
pub mod pool;
pub mod runner;

pub use executor::StepExecutor;
pub use firecracker::FirecrackerDriver;
pub use network::{NetworkAllocator, NetworkConfig};
pub use pool::{PoolConfig, PoolState, VmPool, VmTemplate};
pub use runner::{
    ExecutionTarget, ExecutorConfig, JobReport, JobRequest, StepOutcome, StepReport, StepStatus,
    VmHandle,
};
