//! In-process queue used by tests and single-binary runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::consumer::{QueueConsumer, QueueHealth, QueueMessage, QueueProducer};
use crate::error::QueueError;

#[derive(Default)]
struct Inner {
    ready: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
    dead: Vec<QueueMessage>,
}

/// FIFO queue with the same ack/nack contract as [`crate::RedisQueue`].
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    max_deliveries: u32,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_deliveries: 5,
        }
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Backend("memory queue lock poisoned".into()))
    }

    pub fn ready_len(&self) -> usize {
        self.lock().map(|g| g.ready.len()).unwrap_or(0)
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|g| g.in_flight.len()).unwrap_or(0)
    }

    /// Bodies of all queued (not yet delivered) messages, oldest first.
    pub fn pending_bodies(&self) -> Vec<String> {
        self.lock()
            .map(|g| g.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueProducer for MemoryQueue {
    async fn send(&self, body: &str) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let msg = QueueMessage {
            id: id.clone(),
            body: body.to_string(),
            receipt_handle: String::new(),
            enqueued_at: Utc::now(),
            deliveries: 0,
        };
        self.lock()?.ready.push_back(msg);
        Ok(id)
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let mut inner = self.lock()?;
        let mut out = Vec::new();
        while (out.len() as u32) < max_messages {
            let Some(mut msg) = inner.ready.pop_front() else {
                break;
            };
            msg.deliveries += 1;
            msg.receipt_handle = Uuid::new_v4().to_string();
            inner.in_flight.insert(msg.receipt_handle.clone(), msg.clone());
            out.push(msg);
        }
        Ok(out)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.lock()?
            .in_flight
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| QueueError::NotHeld(format!("unknown receipt handle {receipt_handle}")))
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        let msg = inner
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| {
                QueueError::NotHeld(format!("unknown receipt handle {receipt_handle}"))
            })?;

        if msg.deliveries >= self.max_deliveries {
            inner.dead.push(msg);
        } else {
            inner.ready.push_front(msg);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        Ok(QueueHealth {
            reachable: true,
            depth: Some(self.lock()?.ready.len() as u64),
            backend: "memory",
        })
    }

    async fn dead_letter_depth(&self) -> Result<Option<u64>, QueueError> {
        Ok(Some(self.lock()?.dead.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_removes_message() {
        let q = MemoryQueue::new();
        q.send("a").await.unwrap();
        q.send("b").await.unwrap();

        let batch = q.poll_batch(1).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "a");
        assert_eq!(batch[0].deliveries, 1);
        assert_eq!(q.in_flight_len(), 1);

        q.ack(&batch[0].receipt_handle).await.unwrap();
        assert_eq!(q.in_flight_len(), 0);
        assert!(q.ack(&batch[0].receipt_handle).await.is_err());
        assert_eq!(q.ready_len(), 1);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let q = MemoryQueue::new().with_max_deliveries(2);
        q.send("job").await.unwrap();

        let first = q.poll_batch(10).await.unwrap();
        q.nack(&first[0].receipt_handle).await.unwrap();

        let second = q.poll_batch(10).await.unwrap();
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].deliveries, 2);
        q.nack(&second[0].receipt_handle).await.unwrap();

        assert!(q.poll_batch(10).await.unwrap().is_empty());
        assert_eq!(q.dead_letter_depth().await.unwrap(), Some(1));
    }
}
