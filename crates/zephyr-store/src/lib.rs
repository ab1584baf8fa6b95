//! Store implementations for Zephyr CI.
//!
//! `SqliteStore` is the production backend (single file, the only durable
//! state the orchestrator keeps). `MemoryStore` backs tests and the
//! in-process CLI runner.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
