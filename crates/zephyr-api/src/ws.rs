//! WebSocket handler for real-time job updates.
//!
//! Clients subscribe per job id; the server pushes status changes and log
//! deltas from the observer bus. Each subscription is backed by a bounded
//! buffer, so a stalled socket is dropped by the bus rather than blocking
//! the scheduler.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{extract::State, response::Response};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zephyr_core::run::{JobStatus, LogRecord};
use zephyr_scheduler::observer::SubscriptionId;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    Unsubscribe {
        #[serde(rename = "jobId")]
        job_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JobUpdate {
        #[serde(rename = "jobId")]
        job_id: String,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        logs: Option<Vec<LogRecord>>,
        timestamp: DateTime<Utc>,
    },
    Subscribed {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    Unsubscribed {
        #[serde(rename = "jobId")]
        job_id: String,
    },
    Error {
        message: String,
    },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct Subscription {
    id: SubscriptionId,
    forwarder: JoinHandle<()>,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(64);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Subscribe { job_id }) => {
                if subscriptions.contains_key(&job_id) {
                    continue;
                }
                let (id, mut events) = state.observer.subscribe(&job_id).await;
                let forward_tx = out_tx.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let update = ServerMessage::JobUpdate {
                            job_id: event.job_id,
                            status: event.status,
                            logs: event.logs_delta,
                            timestamp: event.timestamp,
                        };
                        if forward_tx.send(update).await.is_err() {
                            break;
                        }
                    }
                });
                subscriptions.insert(job_id.clone(), Subscription { id, forwarder });
                let _ = out_tx.send(ServerMessage::Subscribed { job_id }).await;
            }
            Ok(ClientMessage::Unsubscribe { job_id }) => {
                if let Some(subscription) = subscriptions.remove(&job_id) {
                    state.observer.unsubscribe(&job_id, subscription.id).await;
                    subscription.forwarder.abort();
                }
                let _ = out_tx.send(ServerMessage::Unsubscribed { job_id }).await;
            }
            Err(e) => {
                let _ = out_tx
                    .send(ServerMessage::Error {
                        message: format!("Invalid message: {e}"),
                    })
                    .await;
            }
        }
    }

    for (job_id, subscription) in subscriptions {
        state.observer.unsubscribe(&job_id, subscription.id).await;
        subscription.forwarder.abort();
    }
    drop(out_tx);
    let _ = writer.await;
}
