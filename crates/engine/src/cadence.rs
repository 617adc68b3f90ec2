//! Learn how often a feed really refreshes and how far ahead it publishes.
//!
//! Each run probes the stream's metadata with a leased credential, folds the
//! `lastUpdatedUTC` / `last_effective` values into the estimator state, and
//! either reschedules itself one estimated interval later or, once both
//! estimates have held for long enough, writes them into the feed and retires.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use feedsync_core::config::CadenceConfig;
use feedsync_core::round_to_canonical;
use feedsync_core::tz::{local_now, resolve_timezone};
use feedsync_lease::CredentialLeasePool;
use feedsync_upstream::{FeedSource, StreamRequest};

use crate::error::{StoreError, SyncError};
use crate::model::{EstimatorState, MAX_OBSERVATIONS};
use crate::store::{EstimatorStore, FeedStore};

/// Agreement counts must exceed this before an estimate is trusted.
pub const STABLE_AFTER: i32 = 4;

/// The two metadata fields the estimator reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub last_updated: Option<DateTime<Utc>>,
    pub last_effective: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Stable { sync_every: i32, days_ahead: i32 },
    Pending { next_run: DateTime<Utc> },
}

fn push_bounded<T: PartialEq + Copy>(obs: &mut Vec<T>, value: T) -> bool {
    if obs.contains(&value) {
        return false;
    }
    obs.push(value);
    if obs.len() > MAX_OBSERVATIONS {
        obs.remove(0);
    }
    true
}

/// Mean gap between consecutive observations, in minutes.
fn mean_interval_minutes(obs: &[DateTime<Utc>]) -> Option<f64> {
    if obs.len() < 2 {
        return None;
    }
    let total: f64 = obs
        .windows(2)
        .map(|w| (w[1] - w[0]).num_seconds() as f64 / 60.0)
        .sum();
    Some(total / (obs.len() - 1) as f64)
}

/// Whole days `last_effective` lies ahead of now, never negative.
fn horizon_days(last_effective: Option<NaiveDateTime>, now_local: NaiveDateTime) -> i32 {
    let Some(effective) = last_effective else {
        return 0;
    };
    let secs = (effective - now_local).num_seconds();
    if secs <= 0 {
        return 0;
    }
    ((secs + 86_399) / 86_400) as i32
}

/// Fold one snapshot into `state` and decide whether the estimate is settled.
pub fn observe(
    state: &mut EstimatorState,
    snap: &Snapshot,
    now: DateTime<Utc>,
    now_local: NaiveDateTime,
) -> Verdict {
    let new_data = snap
        .last_updated
        .is_some_and(|t| push_bounded(&mut state.observed_updates, t));
    if let Some(effective) = snap.last_effective {
        push_bounded(&mut state.observed_effective, effective);
    }

    if let Some(mean) = mean_interval_minutes(&state.observed_updates) {
        let rounded = round_to_canonical(mean);
        if rounded != state.estimated_freq {
            state.freq_agreement = 0;
            state.estimated_freq = rounded;
        } else if new_data {
            state.freq_agreement += 1;
        }
    }

    let days = horizon_days(snap.last_effective, now_local);
    if days != state.estimated_days_ahead {
        state.days_agreement = 0;
        state.estimated_days_ahead = days;
    } else if new_data {
        state.days_agreement += 1;
    }

    state.last_run = Some(now);
    if state.freq_agreement > STABLE_AFTER && state.days_agreement > STABLE_AFTER {
        state.active = false;
        Verdict::Stable {
            sync_every: state.estimated_freq,
            days_ahead: state.estimated_days_ahead,
        }
    } else {
        state.reschedule(now);
        Verdict::Pending {
            next_run: state.next_run,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CadenceReport {
    pub probed: usize,
    pub settled: usize,
    pub failures: usize,
}

/// Runs due estimators against upstream metadata.
pub struct CadenceEstimator {
    feeds: Arc<dyn FeedStore>,
    estimators: Arc<dyn EstimatorStore>,
    source: Arc<dyn FeedSource>,
    pool: CredentialLeasePool,
    config: CadenceConfig,
}

impl CadenceEstimator {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        estimators: Arc<dyn EstimatorStore>,
        source: Arc<dyn FeedSource>,
        pool: CredentialLeasePool,
        config: CadenceConfig,
    ) -> Self {
        Self {
            feeds,
            estimators,
            source,
            pool,
            config,
        }
    }

    /// Start estimating a feed's cadence; a no-op if it already has an estimator.
    pub async fn ensure_estimator(&self, feed_id: i64) -> Result<EstimatorState, SyncError> {
        let feed = self
            .feeds
            .get_feed(feed_id)
            .await?
            .ok_or(StoreError::FeedNotFound(feed_id))?;
        Ok(self.estimators.ensure_estimator(&feed).await?)
    }

    /// Probe every due estimator once.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<CadenceReport, SyncError> {
        let due = self.estimators.due_estimators(now).await?;
        let mut report = CadenceReport::default();
        for state in due {
            report.probed += 1;
            match self.run_one(state, now).await {
                Ok(Verdict::Stable { .. }) => report.settled += 1,
                Ok(Verdict::Pending { .. }) => {}
                Err(e) => {
                    report.failures += 1;
                    warn!(error = %e, "cadence probe failed");
                }
            }
        }
        Ok(report)
    }

    /// Probe one feed and persist the updated estimate.
    pub async fn run_one(
        &self,
        mut state: EstimatorState,
        now: DateTime<Utc>,
    ) -> Result<Verdict, SyncError> {
        let feed = self
            .feeds
            .get_feed(state.feed_id)
            .await?
            .ok_or(StoreError::FeedNotFound(state.feed_id))?;
        let tz = resolve_timezone(&feed.source_tz)?;
        let now_local = local_now(tz, now);

        let request = StreamRequest {
            stream_id: feed.stream_id,
            from: now_local - Duration::days(i64::from(self.config.probe_days.max(1))),
            to: now_local,
            data_option: feed.data_option().map(str::to_string),
        };
        let source = self.source.clone();
        let metadata = match self
            .pool
            .with_lease(|token| async move {
                source.probe(&token, &request).await.map_err(SyncError::from)
            })
            .await
        {
            Ok(m) => m,
            Err(e) => {
                // Retry one estimated interval later.
                state.reschedule(now);
                self.estimators.save_estimator(&state).await?;
                return Err(e);
            }
        };

        let snap = Snapshot {
            last_updated: metadata.last_updated(),
            last_effective: metadata.last_effective(),
        };
        let verdict = observe(&mut state, &snap, now, now_local);
        self.estimators.save_estimator(&state).await?;

        match verdict {
            Verdict::Stable { sync_every, days_ahead } => {
                self.feeds.apply_cadence(feed.id, sync_every, days_ahead).await?;
                info!(feed_id = feed.id, sync_every, days_ahead, "cadence settled");
            }
            Verdict::Pending { next_run } => {
                debug!(
                    feed_id = feed.id,
                    freq = state.estimated_freq,
                    freq_agreement = state.freq_agreement,
                    days_agreement = state.days_agreement,
                    next_run = %next_run,
                    "cadence still settling"
                );
            }
        }
        Ok(verdict)
    }
}

/// Poll for due estimators every `poll` until `shutdown`.
pub async fn run_cadence_loop(
    estimator: Arc<CadenceEstimator>,
    poll: StdDuration,
    shutdown: Arc<Notify>,
) {
    info!(poll_secs = poll.as_secs(), "cadence worker started");
    loop {
        match estimator.run_due(Utc::now()).await {
            Ok(r) if r.probed > 0 => info!(
                probed = r.probed,
                settled = r.settled,
                failures = r.failures,
                "cadence pass"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cadence pass failed"),
        }
        tokio::select! {
            _ = shutdown.notified() => {
                info!("cadence worker shutting down");
                return;
            }
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
