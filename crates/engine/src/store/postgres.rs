//! sqlx-backed stores over the tables in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{validate_table_name, EstimatorStore, FeedStore, JobStore, StagedRow, Warehouse};
use crate::error::{classify_merge_error, map_unique_violation, StoreError, WarehouseError};
use crate::model::{EstimatorState, Feed, IngestResult, Job, NewFeed, NewJob};

const FEED_COLUMNS: &str = "id, stream_id, perspective, data_option, iso, name, source_tz,
    freq_minutes, available_from, first_date, last_date, table_name, active, created_at, updated_at,
    target_first_date, sync_active, sync_every, priority, last_sync, last_error, last_error_at,
    next_sync, pending_sync, catchup_complete, days_ahead, upstream_last_updated";

const JOB_COLUMNS: &str = "id, feed_id, s_date, e_date, scraper_kind, status, worker_id, task_ref,
    attempt, retry_of, superseded_by, error, created_at, updated_at";

const ESTIMATOR_COLUMNS: &str = "feed_id, stream_id, observed_updates, observed_effective,
    estimated_freq, estimated_days_ahead, freq_agreement, days_agreement, active, next_run,
    last_run";

fn expect_row(affected: u64, feed_id: i64) -> Result<(), StoreError> {
    if affected == 0 {
        return Err(StoreError::FeedNotFound(feed_id));
    }
    Ok(())
}

// ── Feeds ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgFeedStore {
    pool: PgPool,
}

impl PgFeedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeedStore for PgFeedStore {
    async fn track_feed(&self, req: NewFeed) -> Result<Feed, StoreError> {
        let key = crate::model::natural_key(req.stream_id, &req.perspective, &req.data_option);
        let sql = format!(
            "INSERT INTO feeds (stream_id, perspective, data_option, iso, name, source_tz,
                                freq_minutes, available_from, table_name, target_first_date,
                                sync_active, sync_every, priority)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $7, $12)
             ON CONFLICT ON CONSTRAINT feeds_natural_key DO UPDATE SET
                iso = EXCLUDED.iso,
                name = COALESCE(EXCLUDED.name, feeds.name),
                source_tz = EXCLUDED.source_tz,
                freq_minutes = EXCLUDED.freq_minutes,
                available_from = EXCLUDED.available_from,
                active = true,
                updated_at = now()
             RETURNING {FEED_COLUMNS}"
        );
        let table = req.resolved_table();
        let target = req.resolved_target();
        sqlx::query_as::<_, Feed>(&sql)
            .bind(req.stream_id)
            .bind(&req.perspective)
            .bind(&req.data_option)
            .bind(&req.iso)
            .bind(&req.name)
            .bind(&req.source_tz)
            .bind(req.freq_minutes)
            .bind(req.available_from)
            .bind(&table)
            .bind(target)
            .bind(req.sync_active)
            .bind(req.priority)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, &key))
    }

    async fn get_feed(&self, id: i64) -> Result<Option<Feed>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = $1");
        Ok(sqlx::query_as::<_, Feed>(&sql).bind(id).fetch_optional(&self.pool).await?)
    }

    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds ORDER BY id");
        Ok(sqlx::query_as::<_, Feed>(&sql).fetch_all(&self.pool).await?)
    }

    async fn due_feeds(&self, now: DateTime<Utc>) -> Result<Vec<Feed>, StoreError> {
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds
             WHERE active
               AND NOT pending_sync
               AND ((NOT sync_active AND NOT catchup_complete)
                    OR (sync_active AND next_sync <= $1))
             ORDER BY priority DESC, id"
        );
        Ok(sqlx::query_as::<_, Feed>(&sql).bind(now).fetch_all(&self.pool).await?)
    }

    async fn set_pending(&self, feed_id: i64, pending: bool) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE feeds SET pending_sync = $2, updated_at = now() WHERE id = $1",
        )
        .bind(feed_id)
        .bind(pending)
        .execute(&self.pool)
        .await?;
        expect_row(done.rows_affected(), feed_id)
    }

    async fn record_ingest(&self, feed_id: i64, result: &IngestResult) -> Result<Feed, StoreError> {
        // LEAST/GREATEST skip NULLs, so the envelope only ever widens.
        let sql = format!(
            "UPDATE feeds SET
                first_date = LEAST(first_date, $2),
                last_date = GREATEST(last_date, $3),
                pending_sync = false,
                last_sync = $4,
                next_sync = GREATEST(next_sync, $4 + make_interval(mins => sync_every)),
                upstream_last_updated = GREATEST(upstream_last_updated, $5),
                catchup_complete = catchup_complete OR $6,
                updated_at = now()
             WHERE id = $1
             RETURNING {FEED_COLUMNS}"
        );
        sqlx::query_as::<_, Feed>(&sql)
            .bind(feed_id)
            .bind(result.first_ts)
            .bind(result.last_ts)
            .bind(result.finished_at)
            .bind(result.upstream_last_updated)
            .bind(result.catchup_complete)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::FeedNotFound(feed_id))
    }

    async fn record_failure(
        &self,
        feed_id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE feeds SET pending_sync = false, last_error = $2, last_error_at = $3,
                updated_at = now()
             WHERE id = $1",
        )
        .bind(feed_id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await?;
        expect_row(done.rows_affected(), feed_id)
    }

    async fn set_catchup_complete(&self, feed_id: i64, complete: bool) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE feeds SET catchup_complete = $2, updated_at = now() WHERE id = $1",
        )
        .bind(feed_id)
        .bind(complete)
        .execute(&self.pool)
        .await?;
        expect_row(done.rows_affected(), feed_id)
    }

    async fn apply_cadence(
        &self,
        feed_id: i64,
        sync_every: i32,
        days_ahead: i32,
    ) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE feeds SET sync_every = $2, days_ahead = $3, updated_at = now() WHERE id = $1",
        )
        .bind(feed_id)
        .bind(sync_every)
        .bind(days_ahead)
        .execute(&self.pool)
        .await?;
        expect_row(done.rows_affected(), feed_id)
    }

    async fn set_sync_active(&self, feed_id: i64, active: bool) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE feeds SET sync_active = $2, updated_at = now() WHERE id = $1",
        )
        .bind(feed_id)
        .bind(active)
        .execute(&self.pool)
        .await?;
        expect_row(done.rows_affected(), feed_id)
    }

    async fn deactivate(&self, feed_id: i64) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE feeds SET active = false, sync_active = false, updated_at = now()
             WHERE id = $1",
        )
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        expect_row(done.rows_affected(), feed_id)
    }
}

// ── Jobs ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_jobs(&self, jobs: &[NewJob]) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "INSERT INTO sync_jobs
                (id, feed_id, s_date, e_date, scraper_kind, status, attempt, retry_of)
             VALUES ($1, $2, $3, $4, $5, 'created', $6, $7)
             RETURNING {JOB_COLUMNS}"
        );
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(jobs.len());
        for job in jobs {
            let row = sqlx::query_as::<_, Job>(&sql)
                .bind(Uuid::new_v4())
                .bind(job.feed_id)
                .bind(job.window.start)
                .bind(job.window.end)
                .bind(job.scraper_kind())
                .bind(job.attempt)
                .bind(job.retry_of)
                .fetch_one(&mut *tx)
                .await?;
            created.push(row);
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, Job>(&sql).bind(id).fetch_optional(&self.pool).await?)
    }

    async fn set_task_ref(&self, id: Uuid, task_ref: &str) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE sync_jobs SET task_ref = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(task_ref)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn mark_running(&self, id: Uuid, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "UPDATE sync_jobs SET status = 'running', worker_id = $2, updated_at = now()
             WHERE id = $1 AND status IN ('created', 'running')
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        if row.is_none() && self.get_job(id).await?.is_none() {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(row)
    }

    async fn mark_complete(&self, id: Uuid) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE sync_jobs SET status = 'complete', error = NULL, updated_at = now()
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            warn!(job_id = %id, "complete ignored: job not running");
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE sync_jobs SET status = 'failed', error = $2, updated_at = now()
             WHERE id = $1 AND status IN ('created', 'running')",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            warn!(job_id = %id, "fail ignored: job already terminal");
        }
        Ok(())
    }

    async fn failed_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs
             WHERE status = 'failed' AND superseded_by IS NULL AND updated_at > $1
             ORDER BY updated_at"
        );
        Ok(sqlx::query_as::<_, Job>(&sql).bind(since).fetch_all(&self.pool).await?)
    }

    async fn running_before(&self, before: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs
             WHERE status = 'running' AND updated_at < $1
             ORDER BY updated_at"
        );
        Ok(sqlx::query_as::<_, Job>(&sql).bind(before).fetch_all(&self.pool).await?)
    }

    async fn mark_superseded(&self, id: Uuid, by: Uuid) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE sync_jobs SET superseded_by = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(by)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn jobs_for_feed(&self, feed_id: i64, limit: i64) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs
             WHERE feed_id = $1 ORDER BY created_at DESC LIMIT $2"
        );
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(feed_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }
}

// ── Warehouse ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ensure_table(&self, table: &str) -> Result<(), WarehouseError> {
        validate_table_name(table)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                feed_id    BIGINT NOT NULL,
                dt         TIMESTAMPTZ NOT NULL,
                local_dt   TIMESTAMP NOT NULL,
                value      DOUBLE PRECISION NOT NULL,
                loaded_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (feed_id, dt)
            )"
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn clear_staging(&self, feed_id: i64) -> Result<(), WarehouseError> {
        sqlx::query("DELETE FROM feed_loader WHERE feed_id = $1")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stage(&self, feed_id: i64, rows: &[StagedRow]) -> Result<u64, WarehouseError> {
        let ts: Vec<DateTime<Utc>> = rows.iter().map(|r| r.ts).collect();
        let local: Vec<NaiveDateTime> = rows.iter().map(|r| r.local_ts).collect();
        let values: Vec<f64> = rows.iter().map(|r| r.value).collect();
        let done = sqlx::query(
            "INSERT INTO feed_loader (feed_id, dt, local_dt, value)
             SELECT $1, t.dt, t.local_dt, t.value
             FROM UNNEST($2::timestamptz[], $3::timestamp[], $4::float8[])
                AS t(dt, local_dt, value)",
        )
        .bind(feed_id)
        .bind(&ts)
        .bind(&local)
        .bind(&values)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn merge(&self, feed_id: i64, table: &str) -> Result<u64, WarehouseError> {
        validate_table_name(table)?;
        // DO UPDATE ... WHERE false never overwrites an existing row, but still
        // raises 21000 when staging repeats a key.
        let sql = format!(
            "INSERT INTO {table} AS prod (feed_id, dt, local_dt, value)
             SELECT feed_id, dt, local_dt, value FROM feed_loader WHERE feed_id = $1
             ON CONFLICT (feed_id, dt) DO UPDATE SET value = prod.value WHERE false"
        );
        let done = sqlx::query(&sql)
            .bind(feed_id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_merge_error(e, table))?;
        Ok(done.rows_affected())
    }

    async fn merge_dedup(&self, feed_id: i64, table: &str) -> Result<u64, WarehouseError> {
        validate_table_name(table)?;
        let sql = format!(
            "INSERT INTO {table} (feed_id, dt, local_dt, value)
             SELECT feed_id, dt, local_dt, value FROM (
                SELECT feed_id, dt, local_dt, value,
                       ROW_NUMBER() OVER (PARTITION BY feed_id, dt ORDER BY local_dt) AS rn
                FROM feed_loader
                WHERE feed_id = $1
             ) sub
             WHERE sub.rn = 1
             ON CONFLICT (feed_id, dt) DO NOTHING"
        );
        let done = sqlx::query(&sql)
            .bind(feed_id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_merge_error(e, table))?;
        debug!(feed_id, table, rows = done.rows_affected(), "dedup merge applied");
        Ok(done.rows_affected())
    }

    async fn add_missing(
        &self,
        feed_id: i64,
        missing: &[DateTime<Utc>],
    ) -> Result<u64, WarehouseError> {
        if missing.is_empty() {
            return Ok(0);
        }
        let done = sqlx::query(
            "INSERT INTO missing_data (feed_id, dt)
             SELECT $1, t.dt FROM UNNEST($2::timestamptz[]) AS t(dt)
             ON CONFLICT (feed_id, dt) DO NOTHING",
        )
        .bind(feed_id)
        .bind(missing)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn missing_timestamps(&self, feed_id: i64) -> Result<Vec<DateTime<Utc>>, WarehouseError> {
        Ok(sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT dt FROM missing_data WHERE feed_id = $1 ORDER BY dt",
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn row_count(&self, feed_id: i64, table: &str) -> Result<u64, WarehouseError> {
        validate_table_name(table)?;
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE feed_id = $1");
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

// ── Cadence estimators ────────────────────────────────────────

#[derive(Clone)]
pub struct PgEstimatorStore {
    pool: PgPool,
}

impl PgEstimatorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EstimatorStore for PgEstimatorStore {
    async fn ensure_estimator(&self, feed: &Feed) -> Result<EstimatorState, StoreError> {
        let seed = EstimatorState::seed(feed);
        sqlx::query(
            "INSERT INTO cadence_estimators (feed_id, stream_id, estimated_freq, next_run)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (feed_id) DO NOTHING",
        )
        .bind(seed.feed_id)
        .bind(seed.stream_id)
        .bind(seed.estimated_freq)
        .bind(seed.next_run)
        .execute(&self.pool)
        .await?;
        self.get_estimator(feed.id)
            .await?
            .ok_or(StoreError::FeedNotFound(feed.id))
    }

    async fn get_estimator(&self, feed_id: i64) -> Result<Option<EstimatorState>, StoreError> {
        let sql = format!("SELECT {ESTIMATOR_COLUMNS} FROM cadence_estimators WHERE feed_id = $1");
        Ok(sqlx::query_as::<_, EstimatorState>(&sql)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn due_estimators(&self, now: DateTime<Utc>) -> Result<Vec<EstimatorState>, StoreError> {
        let sql = format!(
            "SELECT {ESTIMATOR_COLUMNS} FROM cadence_estimators
             WHERE active AND next_run <= $1
             ORDER BY next_run"
        );
        Ok(sqlx::query_as::<_, EstimatorState>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn save_estimator(&self, state: &EstimatorState) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE cadence_estimators SET
                observed_updates = $2,
                observed_effective = $3,
                estimated_freq = $4,
                estimated_days_ahead = $5,
                freq_agreement = $6,
                days_agreement = $7,
                active = $8,
                next_run = $9,
                last_run = $10
             WHERE feed_id = $1",
        )
        .bind(state.feed_id)
        .bind(&state.observed_updates)
        .bind(&state.observed_effective)
        .bind(state.estimated_freq)
        .bind(state.estimated_days_ahead)
        .bind(state.freq_agreement)
        .bind(state.days_agreement)
        .bind(state.active)
        .bind(state.next_run)
        .bind(state.last_run)
        .execute(&self.pool)
        .await?;
        expect_row(done.rows_affected(), state.feed_id)
    }
}
