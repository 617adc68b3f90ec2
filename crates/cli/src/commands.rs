//! Subcommand handlers. Each returns the JSON document to print.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;

use feedsync_core::cadence::parse_freq_minutes;
use feedsync_core::config::Config;
use feedsync_core::tz::resolve_timezone;
use feedsync_engine::store::{
    EstimatorStore, FeedStore, JobStore, PgEstimatorStore, PgFeedStore, PgJobStore, PgWarehouse,
    Warehouse,
};
use feedsync_engine::{init_pg_pool, NewFeed, SyncScheduler};
use feedsync_lease::{CredentialLeasePool, RedisStore, SyncSwitch};
use feedsync_queue::RedisQueue;
use feedsync_upstream::payload::parse_local_timestamp;

use crate::cli::{Command, TrackArgs};

const CLI_WORKER_ID: &str = "feedsync-cli";

pub async fn run(config: &Config, command: Command) -> Result<Value> {
    match command {
        Command::Tick => {
            let report = scheduler(config).await?.tick(Utc::now()).await?;
            Ok(json!({
                "halted": report.halted,
                "feeds_considered": report.feeds_considered,
                "feeds_scheduled": report.feeds_scheduled,
                "jobs_dispatched": report.jobs_dispatched,
                "catchups_closed": report.catchups_closed,
                "failures": report.failures,
            }))
        }
        Command::RetryFailed { window_hours } => {
            let scheduler = scheduler(config).await?;
            let window = window_hours
                .map_or_else(|| scheduler.retry_window(), |h| Duration::hours(i64::from(h)));
            let report = scheduler.retry_failed(Utc::now(), window).await?;
            Ok(json!({
                "abandoned": report.abandoned,
                "requeued": report.requeued,
                "escalated": report.escalated,
            }))
        }
        Command::PauseAll => {
            let (pool, switch) = lease(config).await?;
            pool.pause_all(&switch).await?;
            Ok(json!({ "pool": pool.pool_name(), "sync_active": false }))
        }
        Command::ResumeAll => {
            let (pool, switch) = lease(config).await?;
            pool.resume_all(&switch).await?;
            Ok(json!({ "pool": pool.pool_name(), "sync_active": true }))
        }
        Command::Catchup { feed_id } => {
            let jobs = scheduler(config).await?.force_catchup(feed_id, Utc::now()).await?;
            Ok(json!({ "feed_id": feed_id, "jobs_dispatched": jobs }))
        }
        Command::Feed { feed_id, jobs } => show_feed(&pg(config).await?, feed_id, jobs).await,
        Command::Feeds => {
            let feeds = PgFeedStore::new(pg(config).await?).list_feeds().await?;
            Ok(serde_json::to_value(feeds)?)
        }
        Command::Job { job_id } => {
            let job = PgJobStore::new(pg(config).await?)
                .get_job(job_id)
                .await?
                .ok_or_else(|| anyhow!("job {job_id} not found"))?;
            Ok(serde_json::to_value(job)?)
        }
        Command::PoolStatus => pool_status(config).await,
        Command::Track(args) => track(&pg(config).await?, args).await,
        Command::SetSyncActive { feed_id, active } => {
            PgFeedStore::new(pg(config).await?).set_sync_active(feed_id, active).await?;
            Ok(json!({ "feed_id": feed_id, "sync_active": active }))
        }
        Command::Deactivate { feed_id } => {
            PgFeedStore::new(pg(config).await?).deactivate(feed_id).await?;
            Ok(json!({ "feed_id": feed_id, "active": false }))
        }
        Command::Config => Ok(config.redacted_summary()),
    }
}

async fn pg(config: &Config) -> Result<PgPool> {
    init_pg_pool(&config.postgres).await.context("postgres")
}

async fn lease(config: &Config) -> Result<(CredentialLeasePool, SyncSwitch)> {
    let store = Arc::new(
        RedisStore::connect(&config.redis.url)
            .await
            .context("coordination store")?,
    );

    let pool = CredentialLeasePool::new(store.clone(), config.lease.clone(), CLI_WORKER_ID);
    Ok((pool, SyncSwitch::new(store)))
}

async fn scheduler(config: &Config) -> Result<SyncScheduler> {
    let pg = pg(config).await?;
    let (_, switch) = lease(config).await?;
    let queue = RedisQueue::connect(&config.redis.url, &config.scheduler.queue_name, CLI_WORKER_ID)
        .await
        .context("work queue")?;
    Ok(SyncScheduler::new(
        Arc::new(PgFeedStore::new(pg.clone())),
        Arc::new(PgJobStore::new(pg)),
        Arc::new(queue),
        switch,
        config.scheduler.clone(),
    ))
}

async fn show_feed(pg: &PgPool, feed_id: i64, job_limit: i64) -> Result<Value> {
    let feed = PgFeedStore::new(pg.clone())
        .get_feed(feed_id)
        .await?
        .ok_or_else(|| anyhow!("feed {feed_id} not found"))?;
    let missing = PgWarehouse::new(pg.clone()).missing_timestamps(feed_id).await?;
    let jobs = PgJobStore::new(pg.clone()).jobs_for_feed(feed_id, job_limit).await?;
    let estimator = PgEstimatorStore::new(pg.clone()).get_estimator(feed_id).await?;
    Ok(json!({
        "feed": feed,
        "missing_timestamps": missing,
        "recent_jobs": jobs,
        "estimator": estimator,
    }))
}

async fn pool_status(config: &Config) -> Result<Value> {
    let (pool, switch) = lease(config).await?;
    let record = pool.record().await?;
    let expires_in = pool.time_to_expiry().await?.map(|d| d.num_seconds());
    Ok(json!({
        "pool": pool.pool_name(),
        "sync_active": switch.is_active().await?,
        "record": record.map(|mut r| {
            r.token = "***".to_string();
            r
        }),
        "expires_in_secs": expires_in,
        "usage_count": pool.usage_count().await?,
        "durations": pool.durations().await?,
    }))
}

async fn track(pg: &PgPool, args: TrackArgs) -> Result<Value> {
    resolve_timezone(&args.tz)?;
    let freq_minutes = parse_freq_minutes(&args.freq)
        .filter(|m| *m > 0)
        .ok_or_else(|| anyhow!("invalid frequency: {}", args.freq))?;

    let req = NewFeed {
        stream_id: args.stream_id,
        perspective: args.perspective,
        data_option: args.data_option,
        iso: args.iso,
        name: args.name,
        source_tz: args.tz,
        freq_minutes,
        available_from: args.available_from.as_deref().map(parse_date).transpose()?,
        table_name: args.table,
        target_first_date: args.target_first_date.as_deref().map(parse_date).transpose()?,
        sync_active: args.sync_active,
        priority: args.priority,
    };
    let feed = PgFeedStore::new(pg.clone()).track_feed(req).await?;

    let estimator = if args.estimate {
        Some(PgEstimatorStore::new(pg.clone()).ensure_estimator(&feed).await?)
    } else {
        None
    };
    Ok(json!({ "feed": feed, "estimator": estimator }))
}

/// `YYYY-MM-DD` means midnight; anything else must be a full timestamp.
fn parse_date(s: &str) -> Result<NaiveDateTime> {
    if let Ok(date) = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN));
    }
    parse_local_timestamp(s).ok_or_else(|| anyhow!("unrecognised date: {s}"))
}
