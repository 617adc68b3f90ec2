//! Persistence seams for the engine.
//!
//! Every trait has a Postgres implementation (sqlx) and an in-memory one used
//! by tests and dry runs. Feed mutations go through explicit methods that
//! apply monotonic updates; nothing persists on field assignment.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::error::{StoreError, WarehouseError};
use crate::model::{EstimatorState, Feed, IngestResult, Job, NewFeed, NewJob};

pub use memory::{MemoryEstimatorStore, MemoryFeedStore, MemoryJobStore, MemoryWarehouse};
pub use postgres::{PgEstimatorStore, PgFeedStore, PgJobStore, PgWarehouse};

/// One cleaned row ready for the warehouse.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub ts: DateTime<Utc>,
    /// Wall-clock time as published upstream.
    pub local_ts: NaiveDateTime,
    pub value: f64,
}

#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Insert a feed or refresh the descriptive fields of an existing one.
    async fn track_feed(&self, req: NewFeed) -> Result<Feed, StoreError>;

    async fn get_feed(&self, id: i64) -> Result<Option<Feed>, StoreError>;

    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError>;

    /// Catch-up-only feeds plus steady-state feeds due at `now`, highest priority first.
    async fn due_feeds(&self, now: DateTime<Utc>) -> Result<Vec<Feed>, StoreError>;

    async fn set_pending(&self, feed_id: i64, pending: bool) -> Result<(), StoreError>;

    /// Widen `first_date`/`last_date`, clear `pending_sync`, advance `next_sync`.
    async fn record_ingest(&self, feed_id: i64, result: &IngestResult) -> Result<Feed, StoreError>;

    /// Record `last_error` and clear `pending_sync`.
    async fn record_failure(
        &self,
        feed_id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_catchup_complete(&self, feed_id: i64, complete: bool) -> Result<(), StoreError>;

    /// Write a stable cadence estimate into `sync_params`.
    async fn apply_cadence(
        &self,
        feed_id: i64,
        sync_every: i32,
        days_ahead: i32,
    ) -> Result<(), StoreError>;

    async fn set_sync_active(&self, feed_id: i64, active: bool) -> Result<(), StoreError>;

    /// Retire a feed. Rows are never deleted.
    async fn deactivate(&self, feed_id: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_jobs(&self, jobs: &[NewJob]) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn set_task_ref(&self, id: Uuid, task_ref: &str) -> Result<(), StoreError>;

    /// Move a `created` (or redelivered `running`) job to `running`.
    /// Returns `None` when the job is already terminal.
    async fn mark_running(&self, id: Uuid, worker_id: &str) -> Result<Option<Job>, StoreError>;

    async fn mark_complete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Failed jobs updated since `since` that no retry has replaced yet.
    async fn failed_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Jobs still `running` with no status change since `before`.
    async fn running_before(&self, before: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn mark_superseded(&self, id: Uuid, by: Uuid) -> Result<(), StoreError>;

    /// Most recent jobs of a feed, newest first.
    async fn jobs_for_feed(&self, feed_id: i64, limit: i64) -> Result<Vec<Job>, StoreError>;
}

/// Staging, merge and gap bookkeeping against the warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the production table if it does not exist yet.
    async fn ensure_table(&self, table: &str) -> Result<(), WarehouseError>;

    async fn clear_staging(&self, feed_id: i64) -> Result<(), WarehouseError>;

    async fn stage(&self, feed_id: i64, rows: &[StagedRow]) -> Result<u64, WarehouseError>;

    /// Insert staged rows, ignoring keys already present.
    /// Fails with [`WarehouseError::Conflict`] when staging itself repeats a key.
    async fn merge(&self, feed_id: i64, table: &str) -> Result<u64, WarehouseError>;

    /// Same as [`Warehouse::merge`] after collapsing staged duplicates to one row per key.
    async fn merge_dedup(&self, feed_id: i64, table: &str) -> Result<u64, WarehouseError>;

    /// Union `missing` into the feed's gap set; returns how many were new.
    async fn add_missing(
        &self,
        feed_id: i64,
        missing: &[DateTime<Utc>],
    ) -> Result<u64, WarehouseError>;


    async fn missing_timestamps(&self, feed_id: i64) -> Result<Vec<DateTime<Utc>>, WarehouseError>;

    async fn row_count(&self, feed_id: i64, table: &str) -> Result<u64, WarehouseError>;
}

#[async_trait]
pub trait EstimatorStore: Send + Sync {
    /// Return the feed's estimator, creating a seeded one on first call.
    async fn ensure_estimator(&self, feed: &Feed) -> Result<EstimatorState, StoreError>;

    async fn get_estimator(&self, feed_id: i64) -> Result<Option<EstimatorState>, StoreError>;

    /// Active estimators whose `next_run` has passed.
    async fn due_estimators(&self, now: DateTime<Utc>) -> Result<Vec<EstimatorState>, StoreError>;

    async fn save_estimator(&self, state: &EstimatorState) -> Result<(), StoreError>;
}

/// Accept only plain identifiers for warehouse tables; they are spliced into SQL.
pub fn validate_table_name(table: &str) -> Result<(), WarehouseError> {
    let mut chars = table.chars();
    let valid = table.len() <= 63
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(WarehouseError::InvalidTable(table.to_string()))
    }
}
