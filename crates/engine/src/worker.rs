//! Execute one sync job: fetch, transform, load, record the outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use feedsync_core::tz::{resolve_timezone, to_local};
use feedsync_core::JobRecord;
use feedsync_lease::CredentialLeasePool;
use feedsync_upstream::{FeedSource, StreamPayload, StreamRequest};

use crate::error::{StoreError, SyncError, UpstreamDataError, WarehouseError};
use crate::gaps::find_missing;
use crate::model::{Feed, IngestResult, Job};
use crate::store::{FeedStore, JobStore, StagedRow, Warehouse};
use crate::transform::{transform_rows, EXPECTED_COLUMNS};

/// What happened to a delivered job record.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(IngestResult),
    /// Already complete or failed; a redelivery is a no-op.
    Skipped,
}

/// Rows merged and gaps found by one load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub staged: u64,
    pub merged: u64,
    pub new_missing: u64,
    pub deduplicated: bool,
}

pub struct IngestionWorker {
    feeds: Arc<dyn FeedStore>,
    jobs: Arc<dyn JobStore>,
    warehouse: Arc<dyn Warehouse>,
    source: Arc<dyn FeedSource>,
    pool: CredentialLeasePool,
}

impl IngestionWorker {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        jobs: Arc<dyn JobStore>,
        warehouse: Arc<dyn Warehouse>,
        source: Arc<dyn FeedSource>,
        pool: CredentialLeasePool,
    ) -> Self {
        Self {
            feeds,
            jobs,
            warehouse,
            source,
            pool,
        }
    }

    pub fn worker_id(&self) -> &str {
        self.pool.worker_id()
    }

    /// Same stores and source, leasing credentials under another worker id.
    pub fn for_slot(&self, worker_id: impl Into<String>) -> Self {
        Self {
            feeds: self.feeds.clone(),
            jobs: self.jobs.clone(),
            warehouse: self.warehouse.clone(),
            source: self.source.clone(),
            pool: self.pool.for_worker(worker_id),
        }
    }

    /// Run a job record to completion.
    ///
    /// Failures are recorded on the job and the feed before being returned.
    /// They are never retried here.
    pub async fn execute(&self, record: &JobRecord) -> Result<JobOutcome, SyncError> {
        let Some(job) = self.jobs.mark_running(record.job_id, self.worker_id()).await? else {
            debug!(job_id = %record.job_id, "job already finished, skipping redelivery");
            return Ok(JobOutcome::Skipped);
        };

        match self.run(&job).await {
            Ok(result) => {
                self.feeds.record_ingest(job.feed_id, &result).await?;
                self.jobs.mark_complete(job.id).await?;
                info!(
                    job_id = %job.id,
                    feed_id = job.feed_id,
                    rows = result.rows_loaded,
                    first = %result.first_ts,
                    last = %result.last_ts,
                    "job complete"
                );
                Ok(JobOutcome::Completed(result))
            }
            Err(e) => {
                let message = format!("{}: {e}", e.kind());
                warn!(job_id = %job.id, feed_id = job.feed_id, error = %message, "job failed");
                if let Err(se) = self.jobs.mark_failed(job.id, &message).await {
                    warn!(job_id = %job.id, error = %se, "could not mark job failed");
                }
                let recorded = self.feeds.record_failure(job.feed_id, &message, Utc::now()).await;
                if let Err(se) = recorded {
                    warn!(feed_id = job.feed_id, error = %se, "could not record feed failure");
                }
                Err(e)
            }
        }
    }

    async fn run(&self, job: &Job) -> Result<IngestResult, SyncError> {
        let feed = self
            .feeds
            .get_feed(job.feed_id)
            .await?
            .ok_or(StoreError::FeedNotFound(job.feed_id))?;
        let tz = resolve_timezone(&feed.source_tz)?;
        let window = job.window();

        if let Some(available_from) = feed.available_from {
            if window.end <= available_from {
                return Err(UpstreamDataError::NotYetAvailable {
                    available_from: available_from.to_string(),
                    requested_end: window.end.to_string(),
                }
                .into());
            }
        }

        let request = StreamRequest {
            stream_id: feed.stream_id,
            from: window.start,
            to: window.end,
            data_option: feed.data_option().map(str::to_string),
        };
        let source = self.source.clone();
        let payload: StreamPayload = self
            .pool
            .with_lease(|token| async move {
                source.fetch(&token, &request).await.map_err(SyncError::from)
            })
            .await?;

        let raw = payload.rows();
        if raw.is_empty() {
            return Err(UpstreamDataError::EmptyResult {
                window: window.to_string(),
            }
            .into());
        }
        let columns = payload.column_count();
        if columns != EXPECTED_COLUMNS {
            return Err(UpstreamDataError::SchemaMismatch {
                expected: EXPECTED_COLUMNS,
                actual: columns,
            }
            .into());
        }

        let transformed = transform_rows(&raw, tz)?;
        let (Some(first), Some(last)) = (transformed.rows.first(), transformed.rows.last()) else {
            return Err(UpstreamDataError::EmptyResult {
                window: window.to_string(),
            }
            .into());
        };
        let (first_ts, last_ts) = (first.ts, last.ts);

        let stats = self.load(&feed, job, tz, &transformed.rows).await?;
        debug!(
            job_id = %job.id,
            staged = stats.staged,
            merged = stats.merged,
            new_missing = stats.new_missing,
            deduplicated = stats.deduplicated,
            "rows loaded"
        );

        Ok(IngestResult {
            window,
            rows_loaded: stats.merged,
            first_ts,
            last_ts,
            upstream_last_updated: payload.metadata.last_updated(),
            catchup_complete: closes_catchup(&feed, job, tz, first_ts),
            finished_at: Utc::now(),
        })
    }

    /// Stage, merge and record gaps. Staging is cleared on every exit path.
    async fn load(
        &self,
        feed: &Feed,
        job: &Job,
        tz: Tz,
        rows: &[StagedRow],
    ) -> Result<LoadStats, WarehouseError> {
        self.warehouse.ensure_table(&feed.table_name).await?;
        self.warehouse.clear_staging(feed.id).await?;

        let result = self.stage_and_merge(feed, job, tz, rows).await;
        if let Err(e) = self.warehouse.clear_staging(feed.id).await {
            warn!(feed_id = feed.id, error = %e, "could not clear staging");
        }
        result
    }

    async fn stage_and_merge(
        &self,
        feed: &Feed,
        job: &Job,
        tz: Tz,
        rows: &[StagedRow],
    ) -> Result<LoadStats, WarehouseError> {
        let mut stats = LoadStats {
            staged: self.warehouse.stage(feed.id, rows).await?,
            ..LoadStats::default()
        };

        stats.merged = match self.warehouse.merge(feed.id, &feed.table_name).await {
            Ok(n) => n,
            Err(WarehouseError::Conflict { table, message }) => {
                info!(
                    feed_id = feed.id,
                    table = %table,
                    conflict = %message,
                    "merge conflict, retrying with dedup"
                );
                stats.deduplicated = true;
                self.warehouse.merge_dedup(feed.id, &feed.table_name).await?
            }
            Err(e) => return Err(e),
        };

        let present: Vec<DateTime<Utc>> = rows.iter().map(|r| r.ts).collect();
        let missing = find_missing(job.s_date, feed.freq_minutes, tz, &present);
        if !missing.is_empty() {
            stats.new_missing = self.warehouse.add_missing(feed.id, &missing).await?;
            info!(
                feed_id = feed.id,
                job_id = %job.id,
                missing = missing.len(),
                new = stats.new_missing,
                "gaps detected"
            );
        }
        Ok(stats)
    }
}

/// A catch-up-only feed is done once its history reaches the target.
fn closes_catchup(feed: &Feed, job: &Job, tz: Tz, first_ts: DateTime<Utc>) -> bool {
    if feed.sync.sync_active || feed.sync.catchup_complete {
        return false;
    }
    let earliest = feed.first_date.map_or(first_ts, |f| f.min(first_ts));
    let target = feed.sync.target_first_date;
    to_local(tz, earliest) <= target || job.s_date <= target
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate, NaiveDateTime, TimeZone};
    use serde_json::json;
    use std::sync::Mutex;

    use feedsync_core::config::LeaseConfig;
    use feedsync_core::{DateWindow, JobStatus};
    use feedsync_lease::{CredentialIssuer, IssuedCredential, LeaseError, MemoryStore};
    use feedsync_upstream::UpstreamError;

    use crate::model::{NewFeed, NewJob};
    use crate::store::{MemoryFeedStore, MemoryJobStore, MemoryWarehouse};

    struct FixedIssuer;

    #[async_trait]
    impl CredentialIssuer for FixedIssuer {
        async fn issue(&self) -> Result<IssuedCredential, LeaseError> {
            Ok(IssuedCredential {
                token: "tok".into(),
                expires_in: 3600,
                issued_at: Utc::now(),
            })
        }

        async fn release(&self, _token: &str) -> Result<(), LeaseError> {
            Ok(())
        }
    }

    /// Returns canned payloads and counts calls.
    struct Scripted {
        body: serde_json::Value,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl FeedSource for Scripted {
        async fn fetch(
            &self,
            _token: &str,
            _request: &StreamRequest,
        ) -> Result<StreamPayload, UpstreamError> {
            *self.calls.lock().unwrap() += 1;
            StreamPayload::from_json(&self.body.to_string())
        }
    }

    fn local(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn payload(rows: serde_json::Value) -> serde_json::Value {
        json!({
            "metaData": {
                "lastUpdatedUTC": "2024-01-02T00:00:00",
                "columns": [{"name": "Date/Time"}, {"name": "Value"}]
            },
            "data": rows
        })
    }

    struct Harness {
        feeds: Arc<MemoryFeedStore>,
        jobs: Arc<MemoryJobStore>,
        warehouse: Arc<MemoryWarehouse>,
        source: Arc<Scripted>,
        worker: IngestionWorker,
    }

    async fn harness(body: serde_json::Value) -> Harness {
        let feeds = Arc::new(MemoryFeedStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let warehouse = Arc::new(MemoryWarehouse::new());
        let source = Arc::new(Scripted {
            body,
            calls: Mutex::new(0),
        });
        let store = Arc::new(MemoryStore::new());
        let pool = CredentialLeasePool::new(store, LeaseConfig::default(), "w1");
        pool.create_pool(&FixedIssuer, 2).await.unwrap();
        let worker = IngestionWorker::new(
            feeds.clone(),
            jobs.clone(),
            warehouse.clone(),
            source.clone(),
            pool,
        );
        Harness {
            feeds,
            jobs,
            warehouse,
            source,
            worker,
        }
    }

    async fn track(h: &Harness, available_from: Option<NaiveDateTime>) -> Feed {
        h.feeds
            .track_feed(NewFeed {
                stream_id: 42,
                perspective: "feature".into(),
                data_option: String::new(),
                iso: "ERCOT".into(),
                name: None,
                source_tz: "UTC".into(),
                freq_minutes: 15,
                available_from,
                table_name: None,
                target_first_date: None,
                sync_active: true,
                priority: 0,
            })
            .await
            .unwrap()
    }

    async fn job(h: &Harness, feed: &Feed, start: NaiveDateTime, end: NaiveDateTime) -> JobRecord {
        let window = DateWindow::new(start, end).unwrap();
        h.jobs.create_jobs(&[NewJob::first(feed.id, window)]).await.unwrap()[0].to_record()
    }

    #[tokio::test]
    async fn test_execute_loads_rows_and_records_gaps() {
        let h = harness(payload(json!([
            ["01/01/2024 00:00", 1.0],
            ["01/01/2024 00:15", "2.5"],
            ["01/01/2024 00:30", ""],
            ["01/01/2024 00:45", 4.0]
        ])))
        .await;
        let feed = track(&h, None).await;
        h.feeds.set_pending(feed.id, true).await.unwrap();
        let record = job(&h, &feed, local(1, 0, 0), local(1, 1, 0)).await;

        let outcome = h.worker.execute(&record).await.unwrap();
        let JobOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result.rows_loaded, 3);
        assert_eq!(h.warehouse.rows(feed.id, "ercot_feature").unwrap().len(), 3);
        assert_eq!(
            h.warehouse.missing_timestamps(feed.id).await.unwrap(),
            vec![Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap()]
        );
        assert_eq!(h.warehouse.staged_len(feed.id).unwrap(), 0);

        let feed = h.feeds.get_feed(feed.id).await.unwrap().unwrap();
        assert!(!feed.sync.pending_sync);
        assert_eq!(feed.last_date, Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 45, 0).unwrap()));
        let stored = h.jobs.get_job(record.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_redelivered_job_is_skipped() {
        let h = harness(payload(json!([["01/01/2024 00:00", 1.0]]))).await;
        let feed = track(&h, None).await;
        let record = job(&h, &feed, local(1, 0, 0), local(1, 1, 0)).await;

        h.worker.execute(&record).await.unwrap();
        assert_eq!(h.worker.execute(&record).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(*h.source.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_result_fails_job_and_clears_pending() {
        let h = harness(payload(json!([]))).await;
        let feed = track(&h, None).await;
        h.feeds.set_pending(feed.id, true).await.unwrap();
        let record = job(&h, &feed, local(1, 0, 0), local(1, 1, 0)).await;

        let err = h.worker.execute(&record).await.unwrap_err();
        assert!(matches!(err, SyncError::UpstreamData(UpstreamDataError::EmptyResult { .. })));

        let stored = h.jobs.get_job(record.job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let feed = h.feeds.get_feed(feed.id).await.unwrap().unwrap();
        assert!(!feed.sync.pending_sync);
        assert!(feed.sync.last_error.unwrap().starts_with("upstream_data"));
    }

    #[tokio::test]
    async fn test_schema_mismatch() {
        let h = harness(json!({
            "metaData": {"columns": [{"name": "a"}, {"name": "b"}, {"name": "c"}]},
            "data": [["01/01/2024 00:00", 1.0, 2.0]]
        }))
        .await;
        let feed = track(&h, None).await;
        let record = job(&h, &feed, local(1, 0, 0), local(1, 1, 0)).await;
        let err = h.worker.execute(&record).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::UpstreamData(UpstreamDataError::SchemaMismatch { expected: 2, actual: 3 })
        ));
    }

    #[tokio::test]
    async fn test_not_yet_available_skips_upstream() {
        let h = harness(payload(json!([["01/01/2024 00:00", 1.0]]))).await;
        let feed = track(&h, Some(local(5, 0, 0))).await;
        let record = job(&h, &feed, local(1, 0, 0), local(2, 0, 0)).await;

        let err = h.worker.execute(&record).await.unwrap_err();
        assert!(matches!(err, SyncError::UpstreamData(UpstreamDataError::NotYetAvailable { .. })));
        assert_eq!(*h.source.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closes_catchup_when_target_reached() {
        let h = harness(payload(json!([]))).await;
        let mut feed = track(&h, None).await;
        feed.sync.sync_active = false;
        feed.sync.target_first_date = local(1, 0, 0);
        let record = job(&h, &feed, local(1, 0, 0), local(2, 0, 0)).await;
        let job = h.jobs.get_job(record.job_id).await.unwrap().unwrap();

        let at_target = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(closes_catchup(&feed, &job, chrono_tz::UTC, at_target));

        let mut later = job.clone();
        later.s_date = local(3, 0, 0);
        assert!(!closes_catchup(&feed, &later, chrono_tz::UTC, at_target + Duration::days(3)));
    }
}
