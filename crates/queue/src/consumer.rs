//! Work-queue seams: what the scheduler sends and what workers receive.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// One delivery of a queued job message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Assigned by the producer; the scheduler stores it as the job's task ref.
    pub id: String,
    /// Serialized `JobRecord`.
    pub body: String,
    /// Settles this delivery via `ack`/`nack`.
    pub receipt_handle: String,
    pub enqueued_at: DateTime<Utc>,
    /// 1 on first delivery.
    pub deliveries: u32,
}

impl QueueMessage {
    pub fn is_redelivery(&self) -> bool {
        self.deliveries > 1
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub reachable: bool,
    /// Messages waiting to be delivered, when the backend can tell.
    pub depth: Option<u64>,
    pub backend: &'static str,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.reachable { "up" } else { "down" };
        match self.depth {
            Some(depth) => write!(f, "{} {state}, {depth} waiting", self.backend),
            None => write!(f, "{} {state}", self.backend),
        }
    }
}

/// Receiving side of the work queue.
///
/// Delivery is at-least-once: a message stays owned by the consumer until it
/// is acked, and is handed out again if the consumer nacks it or dies holding it.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Take up to `max_messages`, waiting at most the backend's poll timeout.
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError>;

    /// Settle a delivery for good.
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Hand a delivery back; it is dead-lettered once its deliveries run out.
    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn health_check(&self) -> Result<QueueHealth, QueueError>;

    /// Messages parked in the dead-letter list, if the backend keeps one.
    async fn dead_letter_depth(&self) -> Result<Option<u64>, QueueError> {
        Ok(None)
    }

    /// Mark this consumer alive. Deliveries held by a consumer that stops
    /// calling this become reclaimable by its peers.
    async fn heartbeat(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Return deliveries held by dead consumers to the queue. Returns the count.
    async fn reclaim_abandoned(&self) -> Result<u64, QueueError> {
        Ok(0)
    }
}

/// Sending side of the work queue. Returns the assigned message id.
#[async_trait]
pub trait QueueProducer: Send + Sync {
    async fn send(&self, body: &str) -> Result<String, QueueError>;
}
