//! Zephyr CI Core
//!
//! Core domain types, traits, and error handling for Zephyr CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates.

pub mod context;
pub mod error;
pub mod ids;
pub mod interpolation;
pub mod metrics;
pub mod pipeline;
pub mod ports;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
