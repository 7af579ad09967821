//! Maintenance-queue transport.
//!
//! Messages are JSON objects; the in-memory transport delivers them to the
//! consumer in batches of at most [`DELIVERY_BATCH`] and redelivers a
//! failed batch up to [`MAX_ATTEMPTS`] times before parking its messages
//! on the dead-letter queue. Enqueueing is fire-and-forget from the write
//! path: a queue failure is logged and never fails the client's write.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tessera_topology::IndexDeltaOp;

/// Delivery batch size of the queue transport.
pub const DELIVERY_BATCH: usize = 10;
/// Redelivery attempts before a message is dead-lettered.
pub const MAX_ATTEMPTS: u32 = 3;

/// One unit of asynchronous catalog change produced by a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMaintenanceEvent {
    pub index_name: String,
    pub key_value: String,
    pub shard_id: u32,
    pub operation: IndexDeltaOp,
}

/// Wire shape of maintenance messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MaintenanceMessage {
    BuildIndex {
        database_id: String,
        table_name: String,
        column_name: String,
        index_name: String,
        created_at: u64,
    },
    MaintainIndexEvents {
        database_id: String,
        table_name: String,
        events: Vec<IndexMaintenanceEvent>,
        created_at: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue send failed: {0}")]
    Send(String),
    #[error("queue payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Producer seam between the router and the maintenance transport.
#[async_trait]
pub trait MaintenanceQueue: Send + Sync {
    async fn enqueue(&self, message: MaintenanceMessage) -> Result<(), QueueError>;
}

/// Consumer seam: one delivery batch in, success or the first failure out.
#[async_trait]
pub trait MaintenanceBatchHandler: Send + Sync {
    async fn process_batch(&self, messages: Vec<MaintenanceMessage>) -> anyhow::Result<()>;
}

struct Envelope {
    payload: String,
    attempts: u32,
}

/// Outcome of one [`InMemoryMaintenanceQueue::drain`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried_batches: usize,
    pub dead_lettered: usize,
}

/// In-process transport used by tests and single-process clusters. Real
/// deployments bind the same traits to an external queue.
#[derive(Default)]
pub struct InMemoryMaintenanceQueue {
    pending: Mutex<VecDeque<Envelope>>,
    dead_letter: Mutex<Vec<MaintenanceMessage>>,
}

impl InMemoryMaintenanceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn dead_letter(&self) -> Vec<MaintenanceMessage> {
        self.dead_letter.lock().await.clone()
    }

    /// Delivers every queued message to the handler, redelivering failed
    /// batches and dead-lettering messages that exhaust their attempts.
    /// Runs until the queue is empty.
    pub async fn drain(&self, handler: &dyn MaintenanceBatchHandler) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            let batch: Vec<Envelope> = {
                let mut pending = self.pending.lock().await;
                let take = pending.len().min(DELIVERY_BATCH);
                pending.drain(..take).collect()
            };
            if batch.is_empty() {
                return report;
            }

            let messages: Vec<MaintenanceMessage> = batch
                .iter()
                .filter_map(|envelope| match serde_json::from_str(&envelope.payload) {
                    Ok(message) => Some(message),
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable maintenance message");
                        None
                    }
                })
                .collect();

            match handler.process_batch(messages).await {
                Ok(()) => {
                    report.delivered += batch.len();
                }
                Err(err) => {
                    report.retried_batches += 1;
                    warn!(error = %err, "maintenance batch failed; redelivering");
                    let mut pending = self.pending.lock().await;
                    for mut envelope in batch {
                        envelope.attempts += 1;
                        if envelope.attempts >= MAX_ATTEMPTS {
                            if let Ok(message) = serde_json::from_str(&envelope.payload) {
                                self.dead_letter.lock().await.push(message);
                            }
                            report.dead_lettered += 1;
                        } else {
                            pending.push_back(envelope);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MaintenanceQueue for InMemoryMaintenanceQueue {
    async fn enqueue(&self, message: MaintenanceMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&message)?;
        debug!(payload_bytes = payload.len(), "maintenance message enqueued");
        self.pending.lock().await.push_back(Envelope {
            payload,
            attempts: 0,
        });
        Ok(())
    }
}
