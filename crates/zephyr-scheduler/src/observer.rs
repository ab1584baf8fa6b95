//! Observer bus: fan-out of job status and log deltas to subscribers.
//!
//! Subscribers are message-passing sinks with a bounded buffer, so a slow
//! consumer can never block the scheduler; a subscriber that falls behind
//! is dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use zephyr_core::run::{JobStatus, LogRecord};

/// One delivered update for a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_delta: Option<Vec<LogRecord>>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn status_only(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            logs_delta: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_logs(
        job_id: impl Into<String>,
        status: JobStatus,
        logs: Vec<LogRecord>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            logs_delta: Some(logs),
            timestamp: Utc::now(),
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<JobEvent>,
}

/// Handle returned by `subscribe`; used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Fan-out map from job id to its subscribers.
pub struct ObserverBus {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: std::sync::atomic::AtomicU64,
    buffer: usize,
}

impl ObserverBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
            buffer,
        }
    }

    /// Register a subscriber for one job's events.
    pub async fn subscribe(&self, job_id: &str) -> (SubscriptionId, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers
            .lock()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (SubscriptionId(id), rx)
    }

    pub async fn unsubscribe(&self, job_id: &str, subscription: SubscriptionId) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(list) = subscribers.get_mut(job_id) {
            list.retain(|s| s.id != subscription.0);
            if list.is_empty() {
                subscribers.remove(job_id);
            }
        }
    }

    /// Deliver an event to every current subscriber of its job.
    ///
    /// Delivery is non-blocking: a subscriber whose buffer is full (or
    /// whose receiver is gone) is dropped, and one subscriber's failure
    /// never affects the others.
    pub async fn publish(&self, event: JobEvent) {
        let mut subscribers = self.subscribers.lock().await;
        let Some(list) = subscribers.get_mut(&event.job_id) else {
            return;
        };
        list.retain(|sub| sub.tx.try_send(event.clone()).is_ok());
        if list.is_empty() {
            subscribers.remove(&event.job_id);
        }
    }

    pub async fn subscriber_count(&self, job_id: &str) -> usize {
        self.subscribers
            .lock()
            .await
            .get(job_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl Default for ObserverBus {
    fn default() -> Self {
        Self::new(256)
    }
}
