//! Fires the scheduling tick and the failed-job sweep on a cron.
//!
//! Run exactly one instance. `--once` runs a single tick plus sweep and exits.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

use feedsync_core::config::{load_dotenv, Config};
use feedsync_engine::store::{PgFeedStore, PgJobStore};
use feedsync_engine::{init_pg_pool, parse_cron, run_scheduler, spawn_signal_handler, SyncScheduler};
use feedsync_lease::{RedisStore, SyncSwitch};
use feedsync_queue::RedisQueue;

#[derive(Parser, Debug)]
#[command(name = "sync-scheduler", version, about)]
struct Cli {
    /// Cron expression for the tick (5- or 6-field); overrides SYNC_TICK_CRON.
    #[arg(long, env = "SYNC_SCHEDULER_CRON")]
    cron: Option<String>,

    /// Run one tick and one retry sweep, then exit.
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let pg = init_pg_pool(&config.postgres).await.context("postgres")?;
    let store = Arc::new(
        RedisStore::connect(&config.redis.url)
            .await
            .context("coordination store")?,
    );
    let queue = RedisQueue::connect(&config.redis.url, &config.scheduler.queue_name, "scheduler")
        .await
        .context("work queue")?;

    let cron_expr = cli.cron.unwrap_or_else(|| config.scheduler.tick_cron.clone());
    let schedule = parse_cron(&cron_expr)
        .with_context(|| format!("invalid cron expression: {cron_expr}"))?;

    let scheduler = Arc::new(SyncScheduler::new(
        Arc::new(PgFeedStore::new(pg.clone())),
        Arc::new(PgJobStore::new(pg)),
        Arc::new(queue),
        SyncSwitch::new(store),
        config.scheduler.clone(),
    ));

    if cli.once {
        let now = Utc::now();
        let tick = scheduler.tick(now).await?;
        let retry = scheduler.retry_failed(now, scheduler.retry_window()).await?;
        info!(
            scheduled = tick.feeds_scheduled,
            jobs = tick.jobs_dispatched,
            abandoned = retry.abandoned,
            requeued = retry.requeued,
            escalated = retry.escalated,
            "single tick complete"
        );
        return Ok(());
    }

    let shutdown = Arc::new(Notify::new());
    spawn_signal_handler("sync-scheduler", shutdown.clone());
    info!(cron = %cron_expr, "scheduler running");
    run_scheduler(scheduler, schedule, shutdown).await;
    Ok(())
}
