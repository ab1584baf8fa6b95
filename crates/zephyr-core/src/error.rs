//! Error types for Zephyr CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration and planning errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cyclic dependency involving job '{0}'")]
    CyclicDependency(String),

    #[error("Illegal transition for job '{job}': {from} -> {to}")]
    IllegalTransition {
        job: String,
        from: String,
        to: String,
    },

    // Execution errors
    #[error("Step failed with exit code {exit_code}")]
    StepFailure { exit_code: i32 },

    #[error("Step exceeded timeout of {seconds}s")]
    StepTimeout { seconds: u64 },

    // Warm pool and VM errors
    #[error("VM pool exhausted ({in_use}/{max_total} in use)")]
    PoolExhausted { in_use: usize, max_total: usize },

    #[error("Hypervisor operation failed: {0}")]
    HypervisorFailure(String),

    #[error("Network allocation failed: {0}")]
    NetworkAllocFailure(String),

    // Store errors
    #[error("Conflicting status transition for '{0}'")]
    StoreConflict(String),

    #[error("Database error: {0}")]
    Database(String),

    // Edge errors
    #[error("Unauthorised")]
    Unauthorised,

    #[error("Not found: {0}")]
    NotFound(String),

    // Infrastructure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
