//! Row types for feeds, jobs and cadence estimators.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use feedsync_core::{DateWindow, JobRecord, JobStatus, FEATURE_SCRAPER};

/// Perspective label for forecast streams; they load into `<iso>_fcst`.
pub const FORECAST_PERSPECTIVE: &str = "forecast";

/// Earliest history any feed asks for.
pub fn history_floor() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2015, 1, 1)
        .unwrap_or(NaiveDate::MIN)
        .and_time(chrono::NaiveTime::MIN)
}

// ── Feed ──────────────────────────────────────────────────────

/// Scheduling state embedded in every feed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncParams {
    /// Earliest source-local date wanted.
    pub target_first_date: NaiveDateTime,
    pub sync_active: bool,
    /// Minutes between steady-state polls.
    pub sync_every: i32,
    pub priority: i32,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub next_sync: DateTime<Utc>,
    pub pending_sync: bool,
    pub catchup_complete: bool,
    /// Forecast horizon in whole days.
    pub days_ahead: i32,
    pub upstream_last_updated: Option<DateTime<Utc>>,
}

/// One tracked upstream stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub stream_id: i64,
    pub perspective: String,
    /// Empty when the stream takes no data option.
    pub data_option: String,
    pub iso: String,
    pub name: Option<String>,
    pub source_tz: String,
    /// Native data interval in minutes.
    pub freq_minutes: i32,
    pub available_from: Option<NaiveDateTime>,
    pub first_date: Option<DateTime<Utc>>,
    pub last_date: Option<DateTime<Utc>>,
    pub table_name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub sync: SyncParams,
}

impl Feed {
    pub fn natural_key(&self) -> String {
        natural_key(self.stream_id, &self.perspective, &self.data_option)
    }

    pub fn data_option(&self) -> Option<&str> {
        Some(self.data_option.as_str()).filter(|s| !s.is_empty())
    }

    /// Steady-state feed due for polling at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.sync.sync_active
            && self.sync.next_sync <= now
            && !self.sync.pending_sync
    }

    /// Catch-up-only feed still missing early history.
    pub fn needs_catchup(&self) -> bool {
        self.active
            && !self.sync.sync_active
            && !self.sync.catchup_complete
            && !self.sync.pending_sync

    }
}

pub fn natural_key(stream_id: i64, perspective: &str, data_option: &str) -> String {
    if data_option.is_empty() {
        format!("{stream_id}/{perspective}")
    } else {
        format!("{stream_id}/{perspective}/{data_option}")
    }
}

/// Default warehouse table for a feed.
pub fn default_table_name(iso: &str, perspective: &str) -> String {
    let iso = iso.trim().to_ascii_lowercase();
    if perspective.eq_ignore_ascii_case(FORECAST_PERSPECTIVE) {
        format!("{iso}_fcst")
    } else {
        format!("{iso}_feature")
    }
}

/// Request to start tracking a feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFeed {
    pub stream_id: i64,
    pub perspective: String,
    #[serde(default)]
    pub data_option: String,
    pub iso: String,
    pub name: Option<String>,
    pub source_tz: String,
    pub freq_minutes: i32,
    pub available_from: Option<NaiveDateTime>,
    /// Overrides the `<iso>_fcst` / `<iso>_feature` default.
    pub table_name: Option<String>,
    pub target_first_date: Option<NaiveDateTime>,
    #[serde(default)]
    pub sync_active: bool,
    #[serde(default)]
    pub priority: i32,
}

impl NewFeed {
    pub fn resolved_table(&self) -> String {
        self.table_name
            .clone()
            .unwrap_or_else(|| default_table_name(&self.iso, &self.perspective))
    }

    /// Requested target, never earlier than the history floor or upstream availability.
    pub fn resolved_target(&self) -> NaiveDateTime {
        let floor = match self.available_from {
            Some(avail) => avail.max(history_floor()),
            None => history_floor(),
        };
        self.target_first_date.map_or(floor, |t| t.max(floor))
    }
}

/// Outcome of one successful job, applied with monotonic min/max updates.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestResult {
    pub window: DateWindow,
    pub rows_loaded: u64,
    pub first_ts: DateTime<Utc>,
    pub last_ts: DateTime<Utc>,
    pub upstream_last_updated: Option<DateTime<Utc>>,
    /// The job closed the catch-up gap.
    pub catchup_complete: bool,
    pub finished_at: DateTime<Utc>,
}

// ── Job ───────────────────────────────────────────────────────

/// Persisted sync job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub feed_id: i64,
    pub s_date: NaiveDateTime,
    pub e_date: NaiveDateTime,
    pub scraper_kind: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub task_ref: Option<String>,
    pub attempt: i32,
    pub retry_of: Option<Uuid>,
    pub superseded_by: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn window(&self) -> DateWindow {
        DateWindow {
            start: self.s_date,
            end: self.e_date,
        }
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            job_id: self.id,
            feed_id: self.feed_id,
            s_date: self.s_date,
            e_date: self.e_date,
            scraper_kind: self.scraper_kind.clone(),
            status: self.status,
            worker_ip: self.worker_id.clone(),
        }
    }
}

/// Job about to be inserted with status `created`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub feed_id: i64,
    pub window: DateWindow,
    pub attempt: i32,
    pub retry_of: Option<Uuid>,
}

impl NewJob {
    pub fn first(feed_id: i64, window: DateWindow) -> Self {
        Self {
            feed_id,
            window,
            attempt: 1,
            retry_of: None,
        }
    }

    pub fn retry_of(job: &Job) -> Self {
        Self {
            feed_id: job.feed_id,
            window: job.window(),
            attempt: job.attempt + 1,
            retry_of: Some(job.id),
        }
    }

    pub fn scraper_kind(&self) -> &'static str {
        FEATURE_SCRAPER
    }
}

// ── Cadence estimator ─────────────────────────────────────────

/// Observed values older than this many entries are dropped.
pub const MAX_OBSERVATIONS: usize = 50;

/// Persisted state of one feed's cadence estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EstimatorState {
    pub feed_id: i64,
    pub stream_id: i64,
    /// Distinct `lastUpdatedUTC` values, oldest first.
    pub observed_updates: Vec<DateTime<Utc>>,
    /// Distinct `last_effective` values (source-local), oldest first.
    pub observed_effective: Vec<NaiveDateTime>,
    pub estimated_freq: i32,
    pub estimated_days_ahead: i32,
    pub freq_agreement: i32,
    pub days_agreement: i32,
    pub active: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

impl EstimatorState {
    /// Fresh estimator seeded from the feed's native interval, due immediately.
    pub fn seed(feed: &Feed) -> Self {
        Self {
            feed_id: feed.id,
            stream_id: feed.stream_id,
            observed_updates: Vec::new(),
            observed_effective: Vec::new(),
            estimated_freq: feed.freq_minutes,
            estimated_days_ahead: 0,
            freq_agreement: 0,
            days_agreement: 0,
            active: true,
            next_run: DateTime::<Utc>::UNIX_EPOCH,
            last_run: None,
        }
    }

    pub fn reschedule(&mut self, now: DateTime<Utc>) {
        self.next_run = now + Duration::minutes(i64::from(self.estimated_freq.max(1)));
    }
}
