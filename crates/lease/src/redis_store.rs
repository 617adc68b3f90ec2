//! Redis-backed [`CoordinationStore`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use crate::error::LeaseError;
use crate::store::CoordinationStore;

const SCAN_COUNT: usize = 200;

/// Shared handle over a multiplexed, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, LeaseError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("coordination store connected");
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LeaseError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), LeaseError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LeaseError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, LeaseError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), LeaseError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), LeaseError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, LeaseError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, LeaseError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), LeaseError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (f, v) in fields {
            cmd.arg(*f).arg(v);
        }
        let _: i64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, LeaseError> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, LeaseError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
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
}
