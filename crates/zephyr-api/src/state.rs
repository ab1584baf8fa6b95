//! Application state shared across handlers.

use std::sync::Arc;
use zephyr_core::metrics::MetricsRegistry;
use zephyr_core::ports::Store;
use zephyr_scheduler::{JobScheduler, ObserverBus};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub scheduler: Arc<JobScheduler>,
    pub observer: Arc<ObserverBus>,
    pub metrics: Arc<MetricsRegistry>,
    /// Shared key required on `/api/v1/*` when set.
    pub api_key: Option<String>,
}
