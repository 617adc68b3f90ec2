//! Credential lease pool.
//!
//! Store layout for a pool named `P`:
//!
//! | key | type | TTL |
//! |---|---|---|
//! | `P` | hash (see below) | credential lifetime + 60s |
//! | `P:live` | string | credential lifetime - 30s |
//! | `P:lease:<worker>` | string (start time) | lease TTL |
//! | `P:duration:<worker>` | hash: start, end | 5 min |
//!
//! Pool hash fields: token, max_users, created_at, waiting_users, pause,
//! pause_all, expires_at.
//!
//! The live flag expiring is the rotation signal for the maintenance loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use feedsync_core::config::LeaseConfig;

use crate::error::LeaseError;
use crate::issuer::{CredentialIssuer, IssuedCredential};
use crate::store::CoordinationStore;
use crate::switch::SyncSwitch;

const DURATION_RETENTION: Duration = Duration::from_secs(300);
const RECORD_EXPIRY_SLACK_SECS: i64 = 60;
const LIVE_FLAG_LEAD_SECS: i64 = 30;

/// Decoded pool record.
#[derive(Debug, Clone, Serialize)]
pub struct PoolRecord {
    pub token: String,
    pub max_users: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub waiting_users: i64,
    pub pause: bool,
    pub pause_all: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PoolRecord {
    fn from_fields(pool: &str, fields: &HashMap<String, String>) -> Result<Self, LeaseError> {
        let token = fields
            .get("token")
            .cloned()
            .ok_or_else(|| LeaseError::Corrupt(format!("{pool}: missing token")))?;
        let max_users = fields
            .get("max_users")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| LeaseError::Corrupt(format!("{pool}: bad max_users")))?;
        let ts = |k: &str| {
            fields
                .get(k)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|d| d.with_timezone(&Utc))
        };
        Ok(Self {
            token,
            max_users,
            created_at: ts("created_at"),
            waiting_users: fields
                .get("waiting_users")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            pause: flag(fields.get("pause")),
            pause_all: flag(fields.get("pause_all")),
            expires_at: ts("expires_at"),
        })
    }
}

fn flag(v: Option<&String>) -> bool {
    matches!(v.map(String::as_str), Some("1") | Some("true"))
}

/// One recorded lease, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseDuration {
    pub worker_id: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Result of one maintenance check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Pool was missing and has been bootstrapped.
    Created,
    /// `pause_all` is set; the sync subsystem was switched off instead.
    SyncHalted,
    /// Live flag still present.
    NotDue,
    /// Credential replaced.
    Rotated,
}

/// Handle on a named credential pool, bound to one worker identity.
#[derive(Clone)]
pub struct CredentialLeasePool {
    store: Arc<dyn CoordinationStore>,
    config: LeaseConfig,
    worker_id: String,
}

impl CredentialLeasePool {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: LeaseConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            config,
            worker_id: worker_id.into(),
        }
    }

    /// Same pool, different lease holder.
    pub fn for_worker(&self, worker_id: impl Into<String>) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            worker_id: worker_id.into(),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.config.pool_name
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn live_key(&self) -> String {
        format!("{}:live", self.config.pool_name)
    }

    fn lease_key(&self) -> String {
        format!("{}:lease:{}", self.config.pool_name, self.worker_id)
    }

    fn lease_pattern(&self) -> String {
        format!("{}:lease:*", self.config.pool_name)
    }

    fn duration_key(&self, worker: &str) -> String {
        format!("{}:duration:{}", self.config.pool_name, worker)
    }

    // ── Pool record ─────────────────────────────────────────────────

    pub async fn record(&self) -> Result<Option<PoolRecord>, LeaseError> {
        let fields = self.store.hash_get_all(&self.config.pool_name).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        PoolRecord::from_fields(&self.config.pool_name, &fields).map(Some)
    }

    /// Issue the first credential and write a fresh pool record.
    pub async fn create_pool(
        &self,
        issuer: &dyn CredentialIssuer,
        max_users: u32,
    ) -> Result<PoolRecord, LeaseError> {
        let cred = issuer.issue().await?;
        let now = Utc::now();
        let pool = &self.config.pool_name;
        self.store
            .hash_set(
                pool,
                &[
                    ("token", cred.token.clone()),
                    ("max_users", max_users.to_string()),
                    ("created_at", now.to_rfc3339()),
                    ("waiting_users", "0".to_string()),
                    ("pause", "0".to_string()),
                    ("pause_all", "0".to_string()),
                    ("expires_at", cred.expires_at().to_rfc3339()),
                ],
            )
            .await?;
        self.arm_expiry(&cred).await?;
        info!(pool = %pool, max_users, expires_in = cred.expires_in, "credential pool created");
        self.record()
            .await?
            .ok_or_else(|| LeaseError::PoolNotFound(pool.clone()))
    }

    async fn arm_expiry(&self, cred: &IssuedCredential) -> Result<(), LeaseError> {
        let record_ttl = (cred.expires_in + RECORD_EXPIRY_SLACK_SECS).max(1) as u64;
        self.store
            .expire(&self.config.pool_name, Duration::from_secs(record_ttl))
            .await?;
        let live_ttl = (cred.expires_in - LIVE_FLAG_LEAD_SECS).max(1) as u64;
        self.store
            .set_with_ttl(&self.live_key(), "1", Duration::from_secs(live_ttl))
            .await
    }

    // ── Leasing ─────────────────────────────────────────────────────

    /// Acquire a usage lease and return the current token.
    ///
    /// Blocks while the pool is paused for rotation, then waits for capacity
    /// up to `max_wait_retries` polls. A pause that starts mid-wait is waited
    /// out as well; no lease is written while `pause` is set.
    pub async fn acquire(&self) -> Result<String, LeaseError> {
        let pool = &self.config.pool_name;
        let record = self
            .record()
            .await?
            .ok_or_else(|| LeaseError::PoolNotFound(pool.clone()))?;
        if record.pause {
            self.wait_while_paused().await?;
        }

        if self.usage_count().await? < record.max_users as usize {
            if let Some(token) = self.try_grant().await? {
                return Ok(token);
            }
        }

        self.store.hash_incr(pool, "waiting_users", 1).await?;
        let granted = self.wait_for_lease(record.max_users).await;
        self.store.hash_incr(pool, "waiting_users", -1).await?;
        granted
    }

    async fn wait_for_lease(&self, max_users: u32) -> Result<String, LeaseError> {
        let pool = &self.config.pool_name;
        let mut retries = 0u32;
        loop {
            tokio::time::sleep(self.config.acquire_poll()).await;
            retries += 1;
            if self.is_paused().await? {
                self.wait_while_paused().await?;
            }
            if self.usage_count().await? < max_users as usize {
                if let Some(token) = self.try_grant().await? {
                    debug!(pool = %pool, worker = %self.worker_id, retries, "lease capacity freed");
                    return Ok(token);
                }
            }
            if retries > self.config.max_wait_retries {
                warn!(pool = %pool, worker = %self.worker_id, retries, "lease wait timed out");
                return Err(LeaseError::LeaseTimeout {
                    pool: pool.clone(),
                    retries,
                });
            }
        }
    }

    async fn is_paused(&self) -> Result<bool, LeaseError> {
        let paused = self.store.hash_get(&self.config.pool_name, "pause").await?;
        Ok(flag(paused.as_ref()))
    }

    async fn wait_while_paused(&self) -> Result<(), LeaseError> {
        let pool = &self.config.pool_name;
        let started = Instant::now();
        debug!(pool = %pool, worker = %self.worker_id, "pool paused, waiting");
        loop {
            if !self.is_paused().await? {
                return Ok(());
            }
            if started.elapsed() >= self.config.pause_timeout() {
                return Err(LeaseError::PauseTimeout {
                    pool: pool.clone(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.config.pause_poll()).await;
        }
    }

    /// Write this worker's lease unless a rotation has paused the pool.
    ///
    /// Token and pause flag are read together, after any wait, so the token
    /// handed out is the one current when the lease is written.
    async fn try_grant(&self) -> Result<Option<String>, LeaseError> {
        let pool = &self.config.pool_name;
        let fields = self.store.hash_get_all(pool).await?;
        if flag(fields.get("pause")) {
            debug!(pool = %pool, worker = %self.worker_id, "pause set before grant, holding off");
            return Ok(None);
        }
        let token = fields
            .get("token")
            .cloned()
            .ok_or_else(|| LeaseError::PoolNotFound(pool.clone()))?;
        let now = Utc::now().to_rfc3339();
        self.store
            .set_with_ttl(&self.lease_key(), &now, self.config.lease_ttl())
            .await?;
        let dkey = self.duration_key(&self.worker_id);
        self.store.hash_set(&dkey, &[("start", now)]).await?;
        self.store.expire(&dkey, DURATION_RETENTION).await?;
        debug!(pool = %pool, worker = %self.worker_id, "lease granted");
        Ok(Some(token))
    }

    /// Drop this worker's lease. Safe to call twice or after expiry.
    pub async fn release(&self) -> Result<(), LeaseError> {
        self.store.delete(&self.lease_key()).await?;
        let dkey = self.duration_key(&self.worker_id);
        if self.store.exists(&dkey).await? {
            self.store
                .hash_set(&dkey, &[("end", Utc::now().to_rfc3339())])
                .await?;
            self.store.expire(&dkey, DURATION_RETENTION).await?;
        }
        debug!(pool = %self.config.pool_name, worker = %self.worker_id, "lease released");
        Ok(())
    }

    /// Run `f` with a leased token; the lease is released on every exit path.
    pub async fn with_lease<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LeaseError>,
    {
        let token = self.acquire().await?;
        let result = f(token).await;
        if let Err(e) = self.release().await {
            warn!(
                pool = %self.config.pool_name,
                worker = %self.worker_id,
                error = %e,
                "lease release failed; TTL will reclaim it"
            );
        }
        result
    }

    /// Number of live usage leases.
    pub async fn usage_count(&self) -> Result<usize, LeaseError> {
        Ok(self.store.scan_keys(&self.lease_pattern()).await?.len())
    }

    /// Recorded lease start/end pairs for every worker seen recently.
    pub async fn durations(&self) -> Result<Vec<LeaseDuration>, LeaseError> {
        let prefix = format!("{}:duration:", self.config.pool_name);
        let keys = self.store.scan_keys(&format!("{prefix}*")).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let fields = self.store.hash_get_all(&key).await?;
            let ts = |k: &str| {
                fields
                    .get(k)
                    .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                    .map(|d| d.with_timezone(&Utc))
            };
            let start = ts("start");
            let end = ts("end");
            let duration_ms = match (start, end) {
                (Some(s), Some(e)) => Some((e - s).num_milliseconds()),
                _ => None,
            };
            out.push(LeaseDuration {
                worker_id: key.trim_start_matches(&prefix).to_string(),
                start,
                end,
                duration_ms,
            });
        }
        Ok(out)
    }

    // ── Maintenance ─────────────────────────────────────────────────

    pub async fn is_active(&self) -> Result<bool, LeaseError> {
        self.store.exists(&self.live_key()).await
    }

    pub async fn needs_refresh(&self) -> Result<bool, LeaseError> {
        Ok(!self.is_active().await?)
    }

    /// One maintenance check. Intended for a single dedicated process.
    ///
    /// Rotation pauses new leases, waits the grace interval for in-flight
    /// calls, swaps in a new credential, unpauses and re-arms the live flag.
    /// The old credential is released upstream only after the swap.
    pub async fn refresh(
        &self,
        issuer: &dyn CredentialIssuer,
        switch: &SyncSwitch,
    ) -> Result<RefreshOutcome, LeaseError> {

        let pool = &self.config.pool_name;
        let Some(record) = self.record().await? else {
            self.create_pool(issuer, self.config.max_users).await?;
            return Ok(RefreshOutcome::Created);
        };

        if record.pause_all {
            switch.set_active(false).await?;
            return Ok(RefreshOutcome::SyncHalted);
        }

        if self.is_active().await? {
            return Ok(RefreshOutcome::NotDue);
        }

        let leases = self.usage_count().await?;
        info!(pool = %pool, leases = leases, "rotating credential");
        self.store.hash_set(pool, &[("pause", "1".to_string())]).await?;
        tokio::time::sleep(self.config.refresh_grace()).await;

        let cred = match issuer.issue().await {
            Ok(c) => c,
            Err(e) => {
                // Leave the old token usable rather than stranding workers.
                self.store.hash_set(pool, &[("pause", "0".to_string())]).await?;
                return Err(e);
            }
        };

        self.store
            .hash_set(
                pool,
                &[
                    ("token", cred.token.clone()),
                    ("expires_at", cred.expires_at().to_rfc3339()),
                    ("waiting_users", "0".to_string()),
                    ("pause", "0".to_string()),
                ],
            )
            .await?;
        self.arm_expiry(&cred).await?;

        if let Err(e) = issuer.release(&record.token).await {
            warn!(pool = %pool, error = %e, "failed to release previous credential");
        }
        info!(pool = %pool, expires_at = %cred.expires_at(), "credential rotated");
        Ok(RefreshOutcome::Rotated)
    }

    /// Operator override: halt scheduling across the subsystem.
    pub async fn pause_all(&self, switch: &SyncSwitch) -> Result<(), LeaseError> {
        self.store
            .hash_set(&self.config.pool_name, &[("pause_all", "1".to_string())])
            .await?;
        switch.set_active(false).await
    }

    pub async fn resume_all(&self, switch: &SyncSwitch) -> Result<(), LeaseError> {
        self.store
            .hash_set(&self.config.pool_name, &[("pause_all", "0".to_string())])
            .await?;
        switch.set_active(true).await
    }

    /// Time left on the pooled credential, if known.
    pub async fn time_to_expiry(&self) -> Result<Option<TimeDelta>, LeaseError> {
        Ok(self
            .record()
            .await?
            .and_then(|r| r.expires_at)
            .map(|at| at - Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::store::MemoryStore;

    struct CountingIssuer {
        issued: AtomicU32,
        released: std::sync::Mutex<Vec<String>>,
        fail: bool,
    }

    impl CountingIssuer {
        fn new() -> Self {
            Self {
                issued: AtomicU32::new(0),
                released: std::sync::Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl CredentialIssuer for CountingIssuer {
        async fn issue(&self) -> Result<IssuedCredential, LeaseError> {
            if self.fail {
                return Err(LeaseError::Issuer("rejected".into()));
            }
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(IssuedCredential {
                token: format!("token-{n}"),
                expires_in: 3600,
                issued_at: Utc::now(),
            })
        }

        async fn release(&self, token: &str) -> Result<(), LeaseError> {
            self.released.lock().unwrap().push(token.to_string());
            Ok(())
        }
    }

    fn config() -> LeaseConfig {
        LeaseConfig {
            pool_name: "test_pool".into(),
            max_users: 2,
            lease_ttl_secs: 20,
            acquire_poll_ms: 10,
            max_wait_retries: 3,
            pause_poll_ms: 10,
            pause_timeout_secs: 1,
            refresh_grace_secs: 0,
            ..LeaseConfig::default()
        }
    }

    fn pool(store: &Arc<MemoryStore>) -> CredentialLeasePool {
        CredentialLeasePool::new(store.clone(), config(), "w1")
    }

    #[tokio::test]
    async fn test_acquire_missing_pool() {
        let store = Arc::new(MemoryStore::new());
        let err = pool(&store).acquire().await.unwrap_err();
        assert!(matches!(err, LeaseError::PoolNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_pool_writes_record_and_live_flag() {
        let store = Arc::new(MemoryStore::new());
        let p = pool(&store);
        let rec = p.create_pool(&CountingIssuer::new(), 2).await.unwrap();
        assert_eq!(rec.token, "token-1");
        assert_eq!(rec.max_users, 2);
        assert!(!rec.pause);
        assert!(!rec.pause_all);
        assert!(rec.expires_at.is_some());
        assert!(p.is_active().await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_release_counts_leases() {
        let store = Arc::new(MemoryStore::new());
        let p = pool(&store);
        p.create_pool(&CountingIssuer::new(), 2).await.unwrap();

        assert_eq!(p.acquire().await.unwrap(), "token-1");
        assert_eq!(p.usage_count().await.unwrap(), 1);
        p.for_worker("w2").acquire().await.unwrap();
        assert_eq!(p.usage_count().await.unwrap(), 2);

        p.release().await.unwrap();
        p.release().await.unwrap();
        assert_eq!(p.usage_count().await.unwrap(), 1);

        let durations = p.durations().await.unwrap();
        let w1 = durations.iter().find(|d| d.worker_id == "w1").unwrap();
        assert!(w1.end.is_some());
        assert!(w1.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_full() {
        let store = Arc::new(MemoryStore::new());
        let p = pool(&store);
        p.create_pool(&CountingIssuer::new(), 1).await.unwrap();
        p.acquire().await.unwrap();

        let err = p.for_worker("w2").acquire().await.unwrap_err();
        assert!(matches!(err, LeaseError::LeaseTimeout { retries: 4, .. }));
        let rec = p.record().await.unwrap().unwrap();
        assert_eq!(rec.waiting_users, 0);
    }

    #[tokio::test]
    async fn test_acquire_blocks_while_paused() {
        let store = Arc::new(MemoryStore::new());
        let p = pool(&store);
        p.create_pool(&CountingIssuer::new(), 2).await.unwrap();
        store.hash_set("test_pool", &[("pause", "1".to_string())]).await.unwrap();

        let err = p.acquire().await.unwrap_err();
        assert!(matches!(err, LeaseError::PauseTimeout { .. }));
        assert_eq!(p.usage_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refresh_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let switch = SyncSwitch::new(store.clone());
        let issuer = CountingIssuer::new();
        let p = pool(&store);

        assert_eq!(p.refresh(&issuer, &switch).await.unwrap(), RefreshOutcome::Created);
        assert_eq!(p.refresh(&issuer, &switch).await.unwrap(), RefreshOutcome::NotDue);

        store.delete("test_pool:live").await.unwrap();
        assert!(p.needs_refresh().await.unwrap());
        assert_eq!(p.refresh(&issuer, &switch).await.unwrap(), RefreshOutcome::Rotated);

        let rec = p.record().await.unwrap().unwrap();
        assert_eq!(rec.token, "token-2");
        assert!(!rec.pause);
        assert!(p.is_active().await.unwrap());
        assert_eq!(issuer.released.lock().unwrap().as_slice(), ["token-1"]);
    }

    #[tokio::test]
    async fn test_refresh_failure_unpauses() {
        let store = Arc::new(MemoryStore::new());
        let switch = SyncSwitch::new(store.clone());
        let p = pool(&store);
        p.create_pool(&CountingIssuer::new(), 2).await.unwrap();
        store.delete("test_pool:live").await.unwrap();

        let failing = CountingIssuer { fail: true, ..CountingIssuer::new() };
        assert!(p.refresh(&failing, &switch).await.is_err());
        let rec = p.record().await.unwrap().unwrap();
        assert!(!rec.pause);
        assert_eq!(rec.token, "token-1");
    }

    #[tokio::test]
    async fn test_pause_all_halts_sync() {
        let store = Arc::new(MemoryStore::new());
        let switch = SyncSwitch::new(store.clone());
        let issuer = CountingIssuer::new();
        let p = pool(&store);
        p.create_pool(&issuer, 2).await.unwrap();

        p.pause_all(&switch).await.unwrap();
        store.delete("test_pool:live").await.unwrap();
        assert_eq!(p.refresh(&issuer, &switch).await.unwrap(), RefreshOutcome::SyncHalted);
        assert!(!switch.is_active().await.unwrap());
        // No rotation happened while halted.
        assert_eq!(p.record().await.unwrap().unwrap().token, "token-1");

        p.resume_all(&switch).await.unwrap();
        assert!(switch.is_active().await.unwrap());
        assert_eq!(p.refresh(&issuer, &switch).await.unwrap(), RefreshOutcome::Rotated);
    }

    #[tokio::test]
    async fn test_with_lease_releases_on_error() {
        let store = Arc::new(MemoryStore::new());
        let p = pool(&store);
        p.create_pool(&CountingIssuer::new(), 2).await.unwrap();

        let result: Result<(), LeaseError> = p
            .with_lease(|token| async move {
                assert_eq!(token, "token-1");
                Err(LeaseError::Issuer("upstream blew up".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(p.usage_count().await.unwrap(), 0);
    }
}
