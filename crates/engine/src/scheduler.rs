//! Scheduling tick: pick due feeds, plan their windows, dispatch jobs.
//!
//! One tick runs every `SYNC_TICK_CRON` fire. Each selected feed gets its
//! window split into per-call-sized jobs, which are persisted as `created`
//! and pushed onto the work queue. The feed is marked `pending_sync` so the
//! next tick leaves it alone until a worker reports back.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use feedsync_core::config::SchedulerConfig;
use feedsync_core::tz::resolve_timezone;
use feedsync_lease::SyncSwitch;
use feedsync_queue::{encode_job_record, QueueProducer};

use crate::error::{StoreError, SyncError};
use crate::model::{Feed, Job, NewJob};
use crate::planner::{plan_windows, PlanKind};
use crate::store::{FeedStore, JobStore};

/// Which plan, if any, a feed gets at `now`.
pub fn select_plan(feed: &Feed, now: DateTime<Utc>) -> Option<PlanKind> {
    if feed.needs_catchup() {
        Some(PlanKind::Catchup)
    } else if feed.is_due(now) {
        Some(PlanKind::Steady)
    } else {
        None
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Sync switched off; nothing was considered.
    pub halted: bool,
    pub feeds_considered: usize,
    pub feeds_scheduled: usize,
    pub jobs_dispatched: usize,
    /// Catch-up feeds found already complete.
    pub catchups_closed: usize,
    pub failures: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryReport {
    /// Stale `running` jobs failed so they can be retried.
    pub abandoned: usize,
    pub requeued: usize,
    /// Failed jobs at the attempt cap, left for an operator.
    pub escalated: usize,
}

pub struct SyncScheduler {
    feeds: Arc<dyn FeedStore>,
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn QueueProducer>,
    switch: SyncSwitch,
    config: SchedulerConfig,
}

impl SyncScheduler {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn QueueProducer>,
        switch: SyncSwitch,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            feeds,
            jobs,
            queue,
            switch,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one scheduling pass.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, SyncError> {
        if !self.switch.is_active().await? {
            info!("sync switched off, skipping tick");
            return Ok(TickReport {
                halted: true,
                ..TickReport::default()
            });
        }

        let due = self.feeds.due_feeds(now).await?;
        let mut report = TickReport {
            feeds_considered: due.len(),
            ..TickReport::default()
        };

        for feed in due {
            let Some(kind) = select_plan(&feed, now) else {
                continue;
            };
            match self.schedule_feed(&feed, kind, now).await {
                Ok(0) if kind == PlanKind::Catchup => report.catchups_closed += 1,
                Ok(0) => debug!(feed_id = feed.id, "empty steady window"),
                Ok(n) => {
                    report.feeds_scheduled += 1;
                    report.jobs_dispatched += n;
                }
                Err(e) => {
                    report.failures += 1;
                    warn!(
                        feed_id = feed.id,
                        plan = kind.as_str(),
                        error = %e,
                        "failed to schedule feed"
                    );
                }
            }
        }

        info!(
            considered = report.feeds_considered,
            scheduled = report.feeds_scheduled,
            jobs = report.jobs_dispatched,
            failures = report.failures,
            "scheduling tick complete"
        );
        Ok(report)
    }

    /// Plan, persist and dispatch the jobs for one feed. Returns the job count.
    pub async fn schedule_feed(
        &self,
        feed: &Feed,
        kind: PlanKind,
        now: DateTime<Utc>,
    ) -> Result<usize, SyncError> {
        let tz = resolve_timezone(&feed.source_tz)?;
        let windows = plan_windows(feed, kind, tz, now);
        if windows.is_empty() {
            if kind == PlanKind::Catchup {
                info!(feed_id = feed.id, "catch-up gap already closed");
                self.feeds.set_catchup_complete(feed.id, true).await?;
            }
            return Ok(0);
        }

        let new_jobs: Vec<NewJob> =
            windows.into_iter().map(|w| NewJob::first(feed.id, w)).collect();
        self.feeds.set_pending(feed.id, true).await?;
        let jobs = match self.jobs.create_jobs(&new_jobs).await {
            Ok(jobs) => jobs,
            Err(e) => {
                self.feeds.set_pending(feed.id, false).await?;
                return Err(e.into());
            }
        };

        if let Err(e) = self.dispatch(&jobs).await {
            // Jobs that never reached the queue would hold the feed pending forever.
            self.feeds.set_pending(feed.id, false).await?;
            return Err(e);
        }

        info!(
            feed_id = feed.id,
            stream_id = feed.stream_id,
            plan = kind.as_str(),
            jobs = jobs.len(),
            from = %jobs[0].s_date,
            to = %jobs[jobs.len() - 1].e_date,
            "feed scheduled"
        );
        Ok(jobs.len())
    }

    /// Send jobs to the queue and remember each message id as the task ref.
    async fn dispatch(&self, jobs: &[Job]) -> Result<(), SyncError> {
        for job in jobs {
            let result: Result<(), SyncError> = async {
                let body = encode_job_record(&job.to_record())?;
                let message_id = self.queue.send(&body).await?;
                self.jobs.set_task_ref(job.id, &message_id).await?;
                Ok(())
            }
            .await;
            if let Err(e) = result {
                self.jobs.mark_failed(job.id, &format!("dispatch failed: {e}")).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Re-dispatch jobs that failed within the retry window as fresh jobs.
    ///
    /// Jobs stuck in `running` past the stale limit are failed first, and
    /// their feeds released from `pending_sync`, so they retry with the rest.
    pub async fn retry_failed(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<RetryReport, SyncError> {
        let abandoned = self.fail_abandoned(now).await?;
        let mut report = RetryReport {
            abandoned,
            ..RetryReport::default()
        };

        let failed = self.jobs.failed_since(now - window).await?;

        for job in failed {
            if job.attempt >= self.config.max_attempts as i32 {
                report.escalated += 1;
                error!(
                    job_id = %job.id,
                    feed_id = job.feed_id,
                    attempts = job.attempt,
                    error = job.error.as_deref().unwrap_or(""),
                    "job keeps failing, needs an operator"
                );
                continue;
            }

            let retry = self.jobs.create_jobs(&[NewJob::retry_of(&job)]).await?;
            let Some(retry) = retry.into_iter().next() else {
                continue;
            };
            self.jobs.mark_superseded(job.id, retry.id).await?;
            self.dispatch(std::slice::from_ref(&retry)).await?;
            report.requeued += 1;
            info!(
                job_id = %job.id,
                retry_id = %retry.id,
                attempt = retry.attempt,
                "failed job requeued"
            );
        }

        Ok(report)
    }

    async fn fail_abandoned(&self, now: DateTime<Utc>) -> Result<usize, SyncError> {
        let stale_after = Duration::minutes(i64::from(self.config.stale_running_minutes));
        let stale = self.jobs.running_before(now - stale_after).await?;
        for job in &stale {
            let worker = job.worker_id.as_deref().unwrap_or("unknown");
            warn!(
                job_id = %job.id,
                feed_id = job.feed_id,
                worker = %worker,
                since = %job.updated_at,
                "job abandoned mid-run"
            );
            let reason = format!("abandoned: no progress from {worker} since {}", job.updated_at);
            self.jobs.mark_failed(job.id, &reason).await?;
            self.feeds.set_pending(job.feed_id, false).await?;
        }
        Ok(stale.len())
    }

    /// Reopen a feed's catch-up and schedule it right away.
    pub async fn force_catchup(
        &self,
        feed_id: i64,
        now: DateTime<Utc>,
    ) -> Result<usize, SyncError> {
        let feed = self
            .feeds
            .get_feed(feed_id)
            .await?
            .ok_or(StoreError::FeedNotFound(feed_id))?;
        self.feeds.set_catchup_complete(feed_id, false).await?;
        self.schedule_feed(&feed, PlanKind::Catchup, now).await
    }

    pub fn retry_window(&self) -> Duration {
        Duration::hours(i64::from(self.config.retry_window_hours))
    }
}

/// Parse a cron expression, auto-prepending "0 " for 5-field expressions.
///
/// The `cron` crate requires 6 fields (sec min hr dom mon dow).
pub fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() == 5 {
        Schedule::from_str(&format!("0 {}", expr))
    } else {
        Schedule::from_str(expr)
    }
}

/// Fire a tick plus a retry sweep at every cron fire time until `shutdown`.
pub async fn run_scheduler(
    scheduler: Arc<SyncScheduler>,
    schedule: Schedule,
    shutdown: Arc<Notify>,
) {

    info!("sync scheduler started");

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("cron schedule has no upcoming fire time, stopping");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        debug!(next = %next, "waiting for next tick");

        tokio::select! {
            _ = shutdown.notified() => {
                info!("sync scheduler shutting down");
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let now = Utc::now();
        if let Err(e) = scheduler.tick(now).await {
            warn!(error = %e, "scheduling tick failed");
        }
        match scheduler.retry_failed(now, scheduler.retry_window()).await {
            Ok(r) if r != RetryReport::default() => {
                info!(
                    abandoned = r.abandoned,
                    requeued = r.requeued,
                    escalated = r.escalated,
                    "retry sweep complete"
                )
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "retry sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_cron_six_field() {
        let schedule = parse_cron("0 */15 * * * *").unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        assert_eq!(next.second(), 0);
        assert_eq!(next.minute() % 15, 0);
    }

    #[test]
    fn test_parse_cron_five_field_auto_prefix() {
        let schedule = parse_cron("0 0 * * *").unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        assert_eq!(next.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn test_parse_cron_invalid() {
        assert!(parse_cron("not a cron").is_err());
    }
}
