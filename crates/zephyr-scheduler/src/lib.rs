//! Zephyr CI scheduling layer.
//!
//! The planner turns a validated configuration plus a trigger context into
//! concrete job instances; the DAG engine drives their dependency state
//! machine; the scheduler converts pending work in the store into executed
//! jobs under a global concurrency cap; the observer bus fans job events
//! out to subscribers.

pub mod dag;
pub mod matrix;
pub mod observer;
pub mod planner;
pub mod scheduler;

pub use dag::JobDag;
pub use matrix::{expand_matrix, ExpandedJob, MatrixCombination};
pub use observer::{JobEvent, ObserverBus};
pub use planner::{matches_trigger, plan, resolve_pipelines, validate_pipeline, PipelinePlan};
pub use scheduler::{ConfigLoader, JobScheduler, SchedulerConfig, SchedulerStatus, StaticConfigLoader};
