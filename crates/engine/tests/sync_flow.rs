//! End-to-end scheduling and ingestion against the in-memory backends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Notify;

use feedsync_core::config::{LeaseConfig, SchedulerConfig};
use feedsync_core::{JobRecord, JobStatus};
use feedsync_engine::model::NewJob;
use feedsync_engine::store::{
    FeedStore, JobStore, MemoryFeedStore, MemoryJobStore, MemoryWarehouse, Warehouse,
};
use feedsync_engine::{
    Feed, IngestionWorker, JobOutcome, NewFeed, RunnerConfig, SyncError, SyncScheduler,
    WorkerRunner,
};
use feedsync_lease::{
    CredentialIssuer, CredentialLeasePool, IssuedCredential, LeaseError, MemoryStore, SyncSwitch,
};
use feedsync_queue::{parse_job_record, MemoryQueue, QueueConsumer};
use feedsync_upstream::{FeedSource, StreamPayload, StreamRequest, UpstreamError};

// ── Fixtures ─────────────────────────────────────────────────────────

struct StaticIssuer;

#[async_trait]
impl CredentialIssuer for StaticIssuer {
    async fn issue(&self) -> Result<IssuedCredential, LeaseError> {
        Ok(IssuedCredential {
            token: "tok-1".into(),
            expires_in: 3600,
            issued_at: Utc::now(),
        })
    }

    async fn release(&self, _token: &str) -> Result<(), LeaseError> {
        Ok(())
    }
}

/// Serves a 15-minute series covering the requested window, minus `skip`.
struct ScriptedSource {
    skip: HashSet<NaiveDateTime>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedSource {
    fn new(skip: &[NaiveDateTime]) -> Self {
        Self {
            skip: skip.iter().copied().collect(),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FeedSource for ScriptedSource {
    async fn fetch(
        &self,
        _token: &str,
        request: &StreamRequest,
    ) -> Result<StreamPayload, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(UpstreamError::Api {
                status: 503,
                body: "maintenance".into(),
            });
        }
        let mut rows = Vec::new();
        let mut cursor = request.from;
        while cursor < request.to {
            if !self.skip.contains(&cursor) {
                rows.push(json!([cursor.format("%m/%d/%Y %H:%M").to_string(), 1.5]));
            }
            cursor += Duration::minutes(15);
        }
        let body = json!({
            "metaData": {
                "lastUpdatedUTC": "2024-01-01T06:00:00",
                "columns": [{"name": "Date/Time"}, {"name": "Value"}]
            },
            "data": rows
        });
        StreamPayload::from_json(&body.to_string())
    }
}

fn local(day: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap().and_hms_opt(h, m, 0).unwrap()
}

fn utc(day: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, h, 0, 0).unwrap()
}

fn new_year_2023() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2023, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()
}


struct Engine {
    feeds: Arc<MemoryFeedStore>,
    jobs: Arc<MemoryJobStore>,
    warehouse: Arc<MemoryWarehouse>,
    queue: Arc<MemoryQueue>,
    source: Arc<ScriptedSource>,
    pool: CredentialLeasePool,
    switch: SyncSwitch,
    scheduler: SyncScheduler,
    worker: Arc<IngestionWorker>,
}

async fn engine(skip: &[NaiveDateTime]) -> Engine {
    let store = Arc::new(MemoryStore::new());
    let feeds = Arc::new(MemoryFeedStore::new());
    let jobs = Arc::new(MemoryJobStore::new());
    let warehouse = Arc::new(MemoryWarehouse::new());
    let queue = Arc::new(MemoryQueue::new());
    let source = Arc::new(ScriptedSource::new(skip));

    let pool = CredentialLeasePool::new(store.clone(), LeaseConfig::default(), "worker-a");
    pool.create_pool(&StaticIssuer, 2).await.unwrap();
    let switch = SyncSwitch::new(store);

    let scheduler = SyncScheduler::new(
        feeds.clone(),
        jobs.clone(),
        queue.clone(),
        switch.clone(),
        SchedulerConfig::default(),
    );
    let worker = Arc::new(IngestionWorker::new(
        feeds.clone(),
        jobs.clone(),
        warehouse.clone(),
        source.clone(),
        pool.clone(),
    ));

    Engine {
        feeds,
        jobs,
        warehouse,
        queue,
        source,
        pool,
        switch,
        scheduler,
        worker,
    }
}

async fn track(e: &Engine, freq_minutes: i32, sync_active: bool) -> Feed {
    e.feeds
        .track_feed(NewFeed {
            stream_id: 225,
            perspective: "feature".into(),
            data_option: String::new(),
            iso: "ERCOT".into(),
            name: Some("North hub load".into()),
            source_tz: "UTC".into(),
            freq_minutes,
            available_from: None,
            table_name: None,
            target_first_date: Some(local(1, 0, 0)),
            sync_active,
            priority: 0,
        })
        .await
        .unwrap()
}

async fn drain(e: &Engine) -> Vec<JobRecord> {
    let messages = e.queue.poll_batch(100).await.unwrap();
    let mut records = Vec::new();
    for msg in messages {
        records.push(parse_job_record(&msg).unwrap());
        e.queue.ack(&msg.receipt_handle).await.unwrap();
    }
    records
}

// ── Scheduling ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_catchup_feed_gets_one_job_for_the_gap() {
    let e = engine(&[]).await;
    let feed = track(&e, 15, false).await;
    e.feeds.update(feed.id, |f| f.first_date = Some(utc(10, 0))).unwrap();

    let report = e.scheduler.tick(utc(15, 0)).await.unwrap();
    assert_eq!(report.jobs_dispatched, 1);

    let records = drain(&e).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].s_date, local(1, 0, 0));
    assert_eq!(records[0].e_date, local(10, 0, 0));
    assert_eq!(records[0].status, JobStatus::Created);

    let job = e.jobs.get_job(records[0].job_id).await.unwrap().unwrap();
    assert!(job.task_ref.is_some());
    assert!(e.feeds.get_feed(feed.id).await.unwrap().unwrap().sync.pending_sync);

    // Pending feeds are left alone.
    let again = e.scheduler.tick(utc(15, 1)).await.unwrap();
    assert_eq!(again.jobs_dispatched, 0);
}

#[tokio::test]
async fn test_long_catchup_is_split_by_call_limit() {
    let e = engine(&[]).await;
    let feed = track(&e, 1, false).await;
    e.feeds
        .update(feed.id, |f| {
            f.sync.target_first_date = new_year_2023();
            f.first_date = Some(utc(10, 0));
        })
        .unwrap();

    e.scheduler.tick(utc(15, 0)).await.unwrap();
    let mut records = drain(&e).await;
    records.sort_by_key(|r| r.s_date);

    assert_eq!(records.len(), 7);
    assert_eq!(records[0].s_date, new_year_2023());

    assert_eq!(records[6].e_date, local(10, 0, 0));
    for pair in records.windows(2) {
        assert_eq!(pair[0].e_date, pair[1].s_date);
    }
    for r in &records {
        assert!(r.e_date - r.s_date <= Duration::days(60));
    }
}

#[tokio::test]
async fn test_catchup_already_closed_marks_complete() {
    let e = engine(&[]).await;
    let feed = track(&e, 15, false).await;
    e.feeds.update(feed.id, |f| f.first_date = Some(utc(1, 0))).unwrap();

    let report = e.scheduler.tick(utc(15, 0)).await.unwrap();
    assert_eq!(report.catchups_closed, 1);
    assert!(drain(&e).await.is_empty());
    assert!(e.feeds.get_feed(feed.id).await.unwrap().unwrap().sync.catchup_complete);
}

#[tokio::test]
async fn test_pause_all_halts_scheduling() {
    let e = engine(&[]).await;
    track(&e, 15, true).await;

    e.pool.pause_all(&e.switch).await.unwrap();
    let halted = e.scheduler.tick(Utc::now()).await.unwrap();
    assert!(halted.halted);
    assert!(drain(&e).await.is_empty());

    e.pool.resume_all(&e.switch).await.unwrap();
    let resumed = e.scheduler.tick(Utc::now()).await.unwrap();
    assert!(!resumed.halted);
    assert!(resumed.jobs_dispatched > 0);
}

// ── Ingestion ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_steady_job_ingests_rows_and_gaps() {
    let e = engine(&[local(1, 2, 0), local(1, 3, 30)]).await;
    let feed = track(&e, 15, true).await;
    e.feeds.update(feed.id, |f| f.sync.next_sync = utc(1, 0)).unwrap();

    e.scheduler.tick(utc(1, 6)).await.unwrap();
    let records = drain(&e).await;
    assert_eq!(records.len(), 1);
    assert_eq!((records[0].s_date, records[0].e_date), (local(1, 0, 0), local(1, 6, 0)));

    let outcome = e.worker.execute(&records[0]).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Completed(ref r) if r.rows_loaded == 22));

    assert_eq!(e.warehouse.row_count(feed.id, "ercot_feature").await.unwrap(), 22);
    assert_eq!(
        e.warehouse.missing_timestamps(feed.id).await.unwrap(),
        vec![utc(1, 2), utc(1, 3) + Duration::minutes(30)]
    );

    let feed = e.feeds.get_feed(feed.id).await.unwrap().unwrap();
    assert!(!feed.sync.pending_sync);
    assert_eq!(feed.first_date, Some(utc(1, 0)));
    assert_eq!(feed.last_date, Some(utc(1, 5) + Duration::minutes(45)));
    assert!(feed.sync.last_sync.is_some());
    assert!(feed.sync.upstream_last_updated.is_some());
}

#[tokio::test]
async fn test_replaying_a_window_changes_nothing() {
    let e = engine(&[local(1, 1, 0)]).await;
    let feed = track(&e, 15, true).await;
    let window = feedsync_core::DateWindow::new(local(1, 0, 0), local(1, 4, 0)).unwrap();

    let first = e.jobs.create_jobs(&[NewJob::first(feed.id, window)]).await.unwrap().remove(0);
    e.worker.execute(&first.to_record()).await.unwrap();
    let rows = e.warehouse.row_count(feed.id, "ercot_feature").await.unwrap();
    let missing = e.warehouse.missing_timestamps(feed.id).await.unwrap();

    let replay = e.jobs.create_jobs(&[NewJob::first(feed.id, window)]).await.unwrap().remove(0);
    let outcome = e.worker.execute(&replay.to_record()).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Completed(ref r) if r.rows_loaded == 0));

    assert_eq!(e.warehouse.row_count(feed.id, "ercot_feature").await.unwrap(), rows);
    assert_eq!(e.warehouse.missing_timestamps(feed.id).await.unwrap(), missing);

    // Redelivering a finished job does not call upstream again.
    let calls = e.source.calls.load(Ordering::SeqCst);
    assert_eq!(e.worker.execute(&replay.to_record()).await.unwrap(), JobOutcome::Skipped);
    assert_eq!(e.source.calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_failure_clears_pending_and_sweep_retries_until_cap() {
    let e = engine(&[]).await;
    let feed = track(&e, 15, true).await;
    e.feeds.update(feed.id, |f| f.sync.next_sync = utc(1, 0)).unwrap();
    e.source.fail.store(true, Ordering::SeqCst);

    e.scheduler.tick(utc(1, 6)).await.unwrap();
    let record = drain(&e).await.remove(0);
    let err = e.worker.execute(&record).await.unwrap_err();
    assert!(matches!(err, SyncError::Upstream(_)));

    let stored = e.feeds.get_feed(feed.id).await.unwrap().unwrap();
    assert!(!stored.sync.pending_sync);
    assert!(stored.sync.last_error.is_some());
    assert_eq!(e.jobs.get_job(record.job_id).await.unwrap().unwrap().status, JobStatus::Failed);

    // Attempts 2 and 3 are requeued and fail again; the third failure is escalated.
    for attempt in 2..=3 {
        let report = e.scheduler.retry_failed(Utc::now(), Duration::hours(24)).await.unwrap();
        assert_eq!(report.requeued, 1);
        let retry = drain(&e).await.remove(0);
        let job = e.jobs.get_job(retry.job_id).await.unwrap().unwrap();
        assert_eq!(job.attempt, attempt);
        assert!(job.retry_of.is_some());
        assert!(e.worker.execute(&retry).await.is_err());
    }

    let original = e.jobs.get_job(record.job_id).await.unwrap().unwrap();
    assert!(original.superseded_by.is_some());

    let report = e.scheduler.retry_failed(Utc::now(), Duration::hours(24)).await.unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(report.escalated, 1);
    assert!(drain(&e).await.is_empty());
}

#[tokio::test]
async fn test_job_abandoned_mid_run_is_failed_and_retried() {
    let e = engine(&[]).await;
    let feed = track(&e, 15, true).await;
    e.feeds.update(feed.id, |f| f.sync.next_sync = utc(1, 0)).unwrap();

    e.scheduler.tick(utc(1, 6)).await.unwrap();
    let record = drain(&e).await.remove(0);
    // A worker picked the job up and died before recording anything.
    e.jobs.mark_running(record.job_id, "worker-gone").await.unwrap();
    e.jobs.touch(record.job_id, Utc::now() - Duration::hours(4)).unwrap();
    assert!(e.feeds.get_feed(feed.id).await.unwrap().unwrap().sync.pending_sync);

    let report = e.scheduler.retry_failed(Utc::now(), Duration::hours(24)).await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.requeued, 1);

    let stuck = e.jobs.get_job(record.job_id).await.unwrap().unwrap();
    assert_eq!(stuck.status, JobStatus::Failed);
    assert!(stuck.error.as_deref().unwrap().starts_with("abandoned"));
    assert!(stuck.superseded_by.is_some());
    assert!(!e.feeds.get_feed(feed.id).await.unwrap().unwrap().sync.pending_sync);

    let retry = drain(&e).await.remove(0);
    assert!(matches!(e.worker.execute(&retry).await.unwrap(), JobOutcome::Completed(_)));

    // A job that is merely slow is left running.
    let report = e.scheduler.retry_failed(Utc::now(), Duration::hours(24)).await.unwrap();
    assert_eq!(report.abandoned, 0);
}

// ── Runner ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_runner_consumes_queue_and_stops() {
    let e = engine(&[]).await;
    let feed = track(&e, 15, true).await;
    for day in 1..=3 {
        let window = feedsync_core::DateWindow::new(local(day, 0, 0), local(day, 2, 0)).unwrap();
        let job = e.jobs.create_jobs(&[NewJob::first(feed.id, window)]).await.unwrap().remove(0);
        let body = feedsync_queue::encode_job_record(&job.to_record()).unwrap();
        feedsync_queue::QueueProducer::send(e.queue.as_ref(), &body).await.unwrap();
    }
    feedsync_queue::QueueProducer::send(e.queue.as_ref(), "not json").await.unwrap();

    let shutdown = Arc::new(Notify::new());
    let config = RunnerConfig {
        name: "test-runner".into(),
        concurrency: 2,
        idle_wait: StdDuration::from_millis(10),
        health_interval: StdDuration::from_secs(60),
        heartbeat_interval: StdDuration::from_secs(60),
        shutdown_timeout: StdDuration::from_secs(5),
    };
    let handle = tokio::spawn(WorkerRunner::run(
        e.worker.clone(),
        e.queue.clone(),
        config,
        shutdown.clone(),
    ));

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(10);
    loop {
        let done = e
            .jobs
            .all()
            .unwrap()
            .iter()
            .all(|j| j.status == JobStatus::Complete);
        if done && e.queue.dead_letter_depth().await.unwrap() == Some(1) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "runner did not drain the queue");
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }

    shutdown.notify_one();
    handle.await.unwrap();
    assert_eq!(e.queue.ready_len(), 0);
    assert_eq!(e.queue.in_flight_len(), 0);
    assert_eq!(e.warehouse.row_count(feed.id, "ercot_feature").await.unwrap(), 24);
}
