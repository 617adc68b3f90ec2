//! In-process stores with the same semantics as the Postgres ones.

use std::collections::{btree_map, BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use feedsync_core::JobStatus;

use super::{validate_table_name, EstimatorStore, FeedStore, JobStore, StagedRow, Warehouse};
use crate::error::{StoreError, WarehouseError};
use crate::model::{EstimatorState, Feed, IngestResult, Job, NewFeed, NewJob, SyncParams};

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    m.lock().map_err(|_| StoreError::Poisoned)
}

fn min_opt<T: Ord>(current: Option<T>, candidate: T) -> T {
    match current {
        Some(c) if c < candidate => c,
        _ => candidate,
    }
}

fn max_opt<T: Ord>(current: Option<T>, candidate: T) -> T {
    match current {
        Some(c) if c > candidate => c,
        _ => candidate,
    }
}

// ── Feeds ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryFeedStore {
    feeds: Mutex<BTreeMap<i64, Feed>>,
}

impl MemoryFeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an arbitrary edit; lets tests put a feed in a given state.
    pub fn update<F: FnOnce(&mut Feed)>(&self, feed_id: i64, f: F) -> Result<(), StoreError> {
        self.with_feed(feed_id, |feed| {
            f(feed);
            Ok(())
        })
    }

    fn with_feed<T, F>(&self, feed_id: i64, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Feed) -> Result<T, StoreError>,
    {
        let mut feeds = lock(&self.feeds)?;
        let feed = feeds.get_mut(&feed_id).ok_or(StoreError::FeedNotFound(feed_id))?;
        let out = f(feed)?;
        feed.updated_at = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn track_feed(&self, req: NewFeed) -> Result<Feed, StoreError> {
        let mut feeds = lock(&self.feeds)?;
        let now = Utc::now();
        let existing = feeds.values_mut().find(|f| {
            f.stream_id == req.stream_id
                && f.perspective == req.perspective
                && f.data_option == req.data_option
        });
        if let Some(feed) = existing {
            feed.iso = req.iso.clone();
            if req.name.is_some() {
                feed.name = req.name.clone();
            }
            feed.source_tz = req.source_tz.clone();
            feed.freq_minutes = req.freq_minutes;
            feed.available_from = req.available_from;
            feed.active = true;
            feed.updated_at = now;
            return Ok(feed.clone());
        }

        let id = feeds.keys().next_back().map_or(1, |k| k + 1);
        let feed = Feed {
            id,
            stream_id: req.stream_id,
            perspective: req.perspective.clone(),
            data_option: req.data_option.clone(),
            iso: req.iso.clone(),
            name: req.name.clone(),
            source_tz: req.source_tz.clone(),
            freq_minutes: req.freq_minutes,
            available_from: req.available_from,
            first_date: None,
            last_date: None,
            table_name: req.resolved_table(),
            active: true,
            created_at: now,
            updated_at: now,
            sync: SyncParams {
                target_first_date: req.resolved_target(),
                sync_active: req.sync_active,
                sync_every: req.freq_minutes,
                priority: req.priority,
                last_sync: None,
                last_error: None,
                last_error_at: None,
                next_sync: now,
                pending_sync: false,
                catchup_complete: false,
                days_ahead: 0,
                upstream_last_updated: None,
            },
        };
        feeds.insert(id, feed.clone());
        Ok(feed)
    }

    async fn get_feed(&self, id: i64) -> Result<Option<Feed>, StoreError> {
        Ok(lock(&self.feeds)?.get(&id).cloned())
    }

    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        Ok(lock(&self.feeds)?.values().cloned().collect())
    }

    async fn due_feeds(&self, now: DateTime<Utc>) -> Result<Vec<Feed>, StoreError> {
        let mut due: Vec<Feed> = lock(&self.feeds)?
            .values()
            .filter(|f| f.needs_catchup() || f.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| b.sync.priority.cmp(&a.sync.priority).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn set_pending(&self, feed_id: i64, pending: bool) -> Result<(), StoreError> {
        self.with_feed(feed_id, |f| {
            f.sync.pending_sync = pending;
            Ok(())
        })
    }

    async fn record_ingest(&self, feed_id: i64, result: &IngestResult) -> Result<Feed, StoreError> {
        self.with_feed(feed_id, |f| {
            f.first_date = Some(min_opt(f.first_date, result.first_ts));
            f.last_date = Some(max_opt(f.last_date, result.last_ts));
            let s = &mut f.sync;
            s.pending_sync = false;
            s.last_sync = Some(result.finished_at);
            s.next_sync = s
                .next_sync
                .max(result.finished_at + Duration::minutes(i64::from(s.sync_every)));
            if let Some(updated) = result.upstream_last_updated {
                s.upstream_last_updated = Some(max_opt(s.upstream_last_updated, updated));
            }
            s.catchup_complete |= result.catchup_complete;
            Ok(f.clone())
        })
    }

    async fn record_failure(
        &self,
        feed_id: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_feed(feed_id, |f| {
            f.sync.pending_sync = false;
            f.sync.last_error = Some(error.to_string());
            f.sync.last_error_at = Some(at);
            Ok(())
        })
    }

    async fn set_catchup_complete(&self, feed_id: i64, complete: bool) -> Result<(), StoreError> {
        self.with_feed(feed_id, |f| {
            f.sync.catchup_complete = complete;
            Ok(())
        })
    }

    async fn apply_cadence(
        &self,
        feed_id: i64,
        sync_every: i32,
        days_ahead: i32,
    ) -> Result<(), StoreError> {
        self.with_feed(feed_id, |f| {
            f.sync.sync_every = sync_every;
            f.sync.days_ahead = days_ahead;
            Ok(())
        })
    }

    async fn set_sync_active(&self, feed_id: i64, active: bool) -> Result<(), StoreError> {
        self.with_feed(feed_id, |f| {
            f.sync.sync_active = active;
            Ok(())
        })
    }

    async fn deactivate(&self, feed_id: i64) -> Result<(), StoreError> {
        self.with_feed(feed_id, |f| {
            f.active = false;
            f.sync.sync_active = false;
            Ok(())
        })
    }
}

// ── Jobs ──────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = lock(&self.jobs)?.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.s_date));
        Ok(jobs)
    }

    /// Backdate a job's `updated_at`, for lookback tests.
    pub fn touch(&self, id: Uuid, updated_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.updated_at = updated_at;
        Ok(())
    }

    fn transition<F>(&self, id: Uuid, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        f(job);
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_jobs(&self, new_jobs: &[NewJob]) -> Result<Vec<Job>, StoreError> {
        let mut jobs = lock(&self.jobs)?;
        let now = Utc::now();
        let created: Vec<Job> = new_jobs
            .iter()
            .map(|n| Job {
                id: Uuid::new_v4(),
                feed_id: n.feed_id,
                s_date: n.window.start,
                e_date: n.window.end,
                scraper_kind: n.scraper_kind().to_string(),
                status: JobStatus::Created,
                worker_id: None,
                task_ref: None,
                attempt: n.attempt,
                retry_of: n.retry_of,
                superseded_by: None,
                error: None,
                created_at: now,
                updated_at: now,
            })
            .collect();
        for job in &created {
            jobs.insert(job.id, job.clone());
        }
        Ok(created)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(lock(&self.jobs)?.get(&id).cloned())
    }

    async fn set_task_ref(&self, id: Uuid, task_ref: &str) -> Result<(), StoreError> {
        self.transition(id, |j| j.task_ref = Some(task_ref.to_string()))
    }

    async fn mark_running(&self, id: Uuid, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.status.is_terminal() {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn mark_complete(&self, id: Uuid) -> Result<(), StoreError> {
        self.transition(id, |j| {
            if j.status == JobStatus::Running {
                j.status = JobStatus::Complete;
                j.error = None;
            }
        })
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        self.transition(id, |j| {
            if !j.status.is_terminal() {
                j.status = JobStatus::Failed;
                j.error = Some(error.to_string());
            }
        })
    }

    async fn failed_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut failed: Vec<Job> = lock(&self.jobs)?
            .values()
            .filter(|j| {
                j.status == JobStatus::Failed && j.superseded_by.is_none() && j.updated_at > since
            })
            .cloned()
            .collect();
        failed.sort_by_key(|j| j.updated_at);
        Ok(failed)
    }

    async fn running_before(&self, before: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut stale: Vec<Job> = lock(&self.jobs)?
            .values()
            .filter(|j| j.status == JobStatus::Running && j.updated_at < before)
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.updated_at);
        Ok(stale)
    }

    async fn mark_superseded(&self, id: Uuid, by: Uuid) -> Result<(), StoreError> {
        self.transition(id, |j| j.superseded_by = Some(by))
    }

    async fn jobs_for_feed(&self, feed_id: i64, limit: i64) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = lock(&self.jobs)?
            .values()
            .filter(|j| j.feed_id == feed_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.s_date.cmp(&a.s_date)));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }
}

// ── Warehouse ─────────────────────────────────────────────────

#[derive(Default)]
struct WarehouseState {
    staging: HashMap<i64, Vec<StagedRow>>,
    /// table -> (feed_id, ts) -> row
    tables: HashMap<String, BTreeMap<(i64, DateTime<Utc>), StagedRow>>,
    missing: HashMap<i64, BTreeSet<DateTime<Utc>>>,
}

#[derive(Default)]
pub struct MemoryWarehouse {
    state: Mutex<WarehouseState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, WarehouseState>, WarehouseError> {
        self.state.lock().map_err(|_| WarehouseError::Poisoned)
    }

    /// Production rows of one feed, ordered by timestamp.
    pub fn rows(&self, feed_id: i64, table: &str) -> Result<Vec<StagedRow>, WarehouseError> {
        let state = self.state()?;
        Ok(state
            .tables
            .get(table)
            .map(|t| {
                t.iter()
                    .filter(|((fid, _), _)| *fid == feed_id)
                    .map(|(_, row)| row.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn staged_len(&self, feed_id: i64) -> Result<usize, WarehouseError> {
        Ok(self.state()?.staging.get(&feed_id).map_or(0, Vec::len))
    }

    fn insert_ignoring(
        state: &mut WarehouseState,
        feed_id: i64,
        table: &str,
        rows: Vec<StagedRow>,
    ) -> u64 {
        let target = state.tables.entry(table.to_string()).or_default();
        let mut inserted = 0;
        for row in rows {
            if let btree_map::Entry::Vacant(slot) = target.entry((feed_id, row.ts)) {
                slot.insert(row);
                inserted += 1;
            }
        }
        inserted
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_table(&self, table: &str) -> Result<(), WarehouseError> {
        validate_table_name(table)?;
        self.state()?.tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn clear_staging(&self, feed_id: i64) -> Result<(), WarehouseError> {
        self.state()?.staging.remove(&feed_id);
        Ok(())
    }

    async fn stage(&self, feed_id: i64, rows: &[StagedRow]) -> Result<u64, WarehouseError> {
        self.state()?
            .staging
            .entry(feed_id)
            .or_default()
            .extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn merge(&self, feed_id: i64, table: &str) -> Result<u64, WarehouseError> {
        validate_table_name(table)?;
        let mut state = self.state()?;
        let staged = state.staging.get(&feed_id).cloned().unwrap_or_default();
        let mut seen = BTreeSet::new();
        if let Some(dup) = staged.iter().find(|r| !seen.insert(r.ts)) {
            return Err(WarehouseError::Conflict {
                table: table.to_string(),
                message: format!("staged key ({feed_id}, {}) repeats", dup.ts),
            });
        }
        Ok(Self::insert_ignoring(&mut state, feed_id, table, staged))
    }

    async fn merge_dedup(&self, feed_id: i64, table: &str) -> Result<u64, WarehouseError> {
        validate_table_name(table)?;
        let mut state = self.state()?;
        let mut staged = state.staging.get(&feed_id).cloned().unwrap_or_default();
        staged.sort_by_key(|r| (r.ts, r.local_ts));
        staged.dedup_by_key(|r| r.ts);
        Ok(Self::insert_ignoring(&mut state, feed_id, table, staged))
    }

    async fn add_missing(
        &self,
        feed_id: i64,
        missing: &[DateTime<Utc>],
    ) -> Result<u64, WarehouseError> {
        let mut state = self.state()?;
        let set = state.missing.entry(feed_id).or_default();
        Ok(missing.iter().filter(|ts| set.insert(**ts)).count() as u64)
    }

    async fn missing_timestamps(&self, feed_id: i64) -> Result<Vec<DateTime<Utc>>, WarehouseError> {
        Ok(self
            .state()?
            .missing
            .get(&feed_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn row_count(&self, feed_id: i64, table: &str) -> Result<u64, WarehouseError> {
        Ok(self.rows(feed_id, table)?.len() as u64)
    }
}

// ── Cadence estimators ────────────────────────────────────────

#[derive(Default)]
pub struct MemoryEstimatorStore {
    estimators: Mutex<BTreeMap<i64, EstimatorState>>,
}

impl MemoryEstimatorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EstimatorStore for MemoryEstimatorStore {
    async fn ensure_estimator(&self, feed: &Feed) -> Result<EstimatorState, StoreError> {
        Ok(lock(&self.estimators)?
            .entry(feed.id)
            .or_insert_with(|| EstimatorState::seed(feed))
            .clone())
    }

    async fn get_estimator(&self, feed_id: i64) -> Result<Option<EstimatorState>, StoreError> {
        Ok(lock(&self.estimators)?.get(&feed_id).cloned())
    }

    async fn due_estimators(&self, now: DateTime<Utc>) -> Result<Vec<EstimatorState>, StoreError> {
        let mut due: Vec<EstimatorState> = lock(&self.estimators)?
            .values()
            .filter(|e| e.active && e.next_run <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_run);
        Ok(due)
    }

    async fn save_estimator(&self, state: &EstimatorState) -> Result<(), StoreError> {
        let mut estimators = lock(&self.estimators)?;
        let slot = estimators
            .get_mut(&state.feed_id)
            .ok_or(StoreError::FeedNotFound(state.feed_id))?;
        *slot = state.clone();
        Ok(())
    }
}
