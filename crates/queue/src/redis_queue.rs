//! Redis list-backed reliable queue.
//!
//! Producers `LPUSH` onto `<queue>`. Each consumer moves messages atomically
//! into its own `<queue>:processing:<consumer>` list and removes them on ack,
//! so a message is never lost between delivery and completion. Messages that
//! exhaust their delivery attempts land in `<queue>:dead`.
//!
//! Live consumers refresh `<queue>:consumer:<consumer>` with a TTL. A
//! processing list whose consumer key has expired belongs to a dead run and
//! is pushed back onto the queue by whichever peer notices first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consumer::{QueueConsumer, QueueHealth, QueueMessage, QueueProducer};
use crate::error::QueueError;

/// Default number of deliveries before a message is dead-lettered.
const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Default lifetime of a consumer's liveness key.
const DEFAULT_CONSUMER_TTL_SECS: u64 = 90;

/// Stored form of a message; its serialized text doubles as the receipt handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: String,
    body: String,
    enqueued_at: DateTime<Utc>,
    deliveries: u32,
}

impl Envelope {
    fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    fn decode(raw: &str) -> Result<Self, QueueError> {
        serde_json::from_str(raw)
            .map_err(|e| QueueError::Malformed(format!("corrupt queue envelope: {e}")))
    }
}

/// Redis-backed queue consumer and producer.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    queue_key: String,
    processing_key: String,
    consumer_key: String,
    dead_key: String,
    poll_timeout_secs: f64,
    max_deliveries: u32,
    consumer_ttl_secs: u64,
}

impl RedisQueue {
    /// Connect to `url` and bind to the named queue as `consumer_id`.
    pub async fn connect(
        url: &str,
        queue_name: &str,
        consumer_id: &str,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(|e| QueueError::Unreachable(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        info!(queue = %queue_name, consumer = %consumer_id, "Redis queue connected");
        Ok(Self::from_connection(conn, queue_name, consumer_id))
    }

    pub fn from_connection(conn: ConnectionManager, queue_name: &str, consumer_id: &str) -> Self {
        Self {
            conn,
            queue_key: queue_name.to_string(),
            processing_key: processing_key(queue_name, consumer_id),
            consumer_key: consumer_key(queue_name, consumer_id),
            dead_key: format!("{queue_name}:dead"),
            poll_timeout_secs: 1.0,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            consumer_ttl_secs: DEFAULT_CONSUMER_TTL_SECS,
        }
    }

    pub fn with_poll_timeout(mut self, secs: f64) -> Self {
        self.poll_timeout_secs = secs;
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    /// How long this consumer counts as alive after a heartbeat.
    pub fn with_consumer_ttl(mut self, secs: u64) -> Self {
        self.consumer_ttl_secs = secs.max(1);
        self
    }

    /// Push everything left in this consumer's processing list back onto the
    /// queue. Called at startup to recover messages held by a crashed run
    /// under the same consumer id.
    pub async fn recover_in_flight(&self) -> Result<u64, QueueError> {
        let recovered = self.requeue_all(&self.processing_key).await?;
        if recovered > 0 {
            warn!(
                queue = %self.queue_key,
                recovered,
                "requeued in-flight messages from previous run"
            );
        }
        Ok(recovered)
    }

    async fn requeue_all(&self, from: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let mut moved_count = 0u64;
        loop {
            let moved: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(from)
                .arg(&self.queue_key)
                .query_async(&mut conn)
                .await?;
            match moved {
                Some(_) => moved_count += 1,
                None => break,
            }
        }
        Ok(moved_count)
    }

    async fn processing_lists(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let pattern = processing_key(&self.queue_key, "*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn to_message(raw: String) -> Result<QueueMessage, QueueError> {
        let env = Envelope::decode(&raw)?;
        Ok(QueueMessage {
            id: env.id,
            body: env.body,
            receipt_handle: raw,
            enqueued_at: env.enqueued_at,
            deliveries: env.deliveries,
        })
    }
}

#[async_trait]
impl QueueProducer for RedisQueue {
    async fn send(&self, body: &str) -> Result<String, QueueError> {
        let env = Envelope {
            id: Uuid::new_v4().to_string(),
            body: body.to_string(),
            enqueued_at: Utc::now(),
            deliveries: 1,
        };
        let mut conn = self.conn.clone();
        let _: i64 = conn.lpush(&self.queue_key, env.encode()?).await?;
        debug!(queue = %self.queue_key, message_id = %env.id, "message enqueued");
        Ok(env.id)
    }
}

#[async_trait]
impl QueueConsumer for RedisQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let mut conn = self.conn.clone();
        let mut raw = Vec::new();

        // Block for the first message only; drain the rest without waiting.
        let first: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_key)
            .arg(&self.processing_key)
            .arg(self.poll_timeout_secs)
            .query_async(&mut conn)
            .await?;
        if let Some(first) = first {
            raw.push(first);
            while (raw.len() as u32) < max_messages {
                let next: Option<String> = redis::cmd("RPOPLPUSH")
                    .arg(&self.queue_key)
                    .arg(&self.processing_key)
                    .query_async(&mut conn)
                    .await?;
                match next {
                    Some(n) => raw.push(n),
                    None => break,
                }
            }
        }

        let mut messages = Vec::with_capacity(raw.len());
        for r in raw {
            match Self::to_message(r.clone()) {
                Ok(m) => messages.push(m),
                Err(e) => {
                    warn!(queue = %self.queue_key, error = %e, "dead-lettering unreadable message");
                    let _: i64 = conn.lrem(&self.processing_key, 1, &r).await?;
                    let _: i64 = conn.lpush(&self.dead_key, &r).await?;
                }
            }
        }
        debug!(queue = %self.queue_key, count = messages.len(), "polled messages");
        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(&self.processing_key, 1, receipt_handle).await?;
        if removed == 0 {
            return Err(QueueError::NotHeld(format!(
                "message not in {}; already acked or recovered",
                self.processing_key
            )));
        }
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(&self.processing_key, 1, receipt_handle).await?;
        if removed == 0 {
            return Err(QueueError::NotHeld(format!(
                "message not in {}; cannot nack",
                self.processing_key
            )));
        }
        let mut env = Envelope::decode(receipt_handle)?;
        if env.deliveries >= self.max_deliveries {
            warn!(
                queue = %self.queue_key,
                message_id = %env.id,
                attempts = env.deliveries,
                "message dead-lettered"
            );
            let _: i64 = conn.lpush(&self.dead_key, receipt_handle).await?;
        } else {
            env.deliveries += 1;
            // Redeliver ahead of newer work.
            let _: i64 = conn.rpush(&self.queue_key, env.encode()?).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let mut conn = self.conn.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        let depth: Option<u64> = match pong {
            Ok(_) => conn.llen(&self.queue_key).await.ok(),
            Err(_) => None,
        };
        Ok(QueueHealth {
            reachable: depth.is_some(),
            depth,
            backend: "redis",
        })
    }

    async fn dead_letter_depth(&self) -> Result<Option<u64>, QueueError> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn.llen(&self.dead_key).await?;
        Ok(Some(depth))
    }

    async fn heartbeat(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(&self.consumer_key, "1", self.consumer_ttl_secs).await?;
        Ok(())
    }

    async fn reclaim_abandoned(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let mut reclaimed = 0u64;
        for list in self.processing_lists().await? {
            if list == self.processing_key {
                continue;
            }
            let Some(owner) = consumer_of(&self.queue_key, &list) else {
                continue;
            };
            let alive: bool = conn.exists(consumer_key(&self.queue_key, owner)).await?;
            if alive {
                continue;
            }
            let moved = self.requeue_all(&list).await?;
            if moved > 0 {
                warn!(
                    queue = %self.queue_key,
                    consumer = %owner,
                    moved,
                    "reclaimed deliveries from silent consumer"
                );

            }
            reclaimed += moved;
        }
        Ok(reclaimed)
    }
}

fn processing_key(queue: &str, consumer: &str) -> String {
    format!("{queue}:processing:{consumer}")
}

fn consumer_key(queue: &str, consumer: &str) -> String {
    format!("{queue}:consumer:{consumer}")
}

/// Consumer id owning a processing list of `queue`.
fn consumer_of<'a>(queue: &str, list: &'a str) -> Option<&'a str> {
    list.strip_prefix(queue)?
        .strip_prefix(":processing:")
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_becomes_message_with_raw_handle() {
        let env = Envelope {
            id: "m-1".into(),
            body: r#"{"feed_id":3}"#.into(),
            enqueued_at: Utc::now(),
            deliveries: 2,
        };
        let raw = env.encode().unwrap();
        let msg = RedisQueue::to_message(raw.clone()).unwrap();
        assert_eq!(msg.id, "m-1");
        assert_eq!(msg.deliveries, 2);
        assert_eq!(msg.receipt_handle, raw);
    }

    #[test]
    fn test_processing_list_owner() {
        let list = processing_key("feed_sync", "host-a");
        assert_eq!(consumer_of("feed_sync", &list), Some("host-a"));
        assert_eq!(consumer_key("feed_sync", "host-a"), "feed_sync:consumer:host-a");
        assert_eq!(consumer_of("feed_sync", "feed_sync:dead"), None);
        assert_eq!(consumer_of("feed_sync", "feed_sync:processing:"), None);
        assert_eq!(consumer_of("other", &list), None);
    }

    #[test]
    fn test_corrupt_envelope_is_parse_error() {
        let err = RedisQueue::to_message("not json".into()).unwrap_err();
        assert!(matches!(err, QueueError::Malformed(_)));
    }
}
