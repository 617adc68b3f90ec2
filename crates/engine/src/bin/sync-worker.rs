//! Consumes sync jobs from the work queue and ingests them.
//!
//! Any number of these may run side by side; each leases the shared upstream
//! credential per call. The worker id must survive restarts: it names the
//! queue's processing list that `recover_in_flight` drains at startup. It
//! defaults to the host name.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use clap::Parser;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use feedsync_core::config::{load_dotenv, Config};
use feedsync_engine::store::{PgFeedStore, PgJobStore, PgWarehouse};
use feedsync_engine::{
    init_pg_pool, spawn_signal_handler, IngestionWorker, RunnerConfig, WorkerRunner,
};
use feedsync_lease::{CredentialLeasePool, RedisStore};
use feedsync_queue::{QueueConsumer, RedisQueue};
use feedsync_upstream::FeedApiClient;

#[derive(Parser, Debug)]
#[command(name = "sync-worker", version, about)]
struct Cli {
    /// Worker identity used for leases and the queue's processing list.
    /// Defaults to the host name.
    #[arg(long, env = "SYNC_WORKER_ID")]
    worker_id: Option<String>,

    /// Health report interval in seconds.
    #[arg(long, env = "SYNC_WORKER_HEALTH_INTERVAL", default_value_t = 30)]
    health_interval: u64,

    /// Seconds between queue heartbeats.
    #[arg(long, env = "SYNC_WORKER_HEARTBEAT_INTERVAL", default_value_t = 15)]
    heartbeat_interval: u64,

    /// Seconds without a heartbeat before peers reclaim this worker's deliveries.
    #[arg(long, env = "SYNC_WORKER_CONSUMER_TTL", default_value_t = 90)]
    consumer_ttl: u64,

    /// Seconds in-flight jobs get to finish on shutdown.
    #[arg(long, env = "SYNC_WORKER_SHUTDOWN_TIMEOUT", default_value_t = 120)]
    shutdown_timeout: u64,
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

    ensure!(
        cli.heartbeat_interval * 2 < cli.consumer_ttl,
        "heartbeat interval {}s is too close to the consumer TTL {}s",
        cli.heartbeat_interval,
        cli.consumer_ttl
    );
    let worker_id = match cli.worker_id {
        Some(id) => id,
        None => host_worker_id()?,
    };

    let pg = init_pg_pool(&config.postgres).await.context("postgres")?;
    let store = Arc::new(
        RedisStore::connect(&config.redis.url)
            .await
            .context("coordination store")?,
    );
    let queue = RedisQueue::connect(&config.redis.url, &config.scheduler.queue_name, &worker_id)
        .await
        .context("work queue")?
        .with_consumer_ttl(cli.consumer_ttl);
    queue.heartbeat().await.context("queue heartbeat")?;
    queue.recover_in_flight().await.context("recovering in-flight jobs")?;

    let source = FeedApiClient::from_config(&config.upstream).context("upstream client")?;
    let pool = CredentialLeasePool::new(store, config.lease.clone(), worker_id.clone());
    let worker = Arc::new(IngestionWorker::new(
        Arc::new(PgFeedStore::new(pg.clone())),
        Arc::new(PgJobStore::new(pg.clone())),
        Arc::new(PgWarehouse::new(pg)),
        Arc::new(source),
        pool,
    ));

    let runner_config = RunnerConfig {
        name: worker_id,
        concurrency: config.worker.concurrency,
        idle_wait: Duration::from_millis(config.worker.poll_ms),
        health_interval: Duration::from_secs(cli.health_interval),
        heartbeat_interval: Duration::from_secs(cli.heartbeat_interval),
        shutdown_timeout: Duration::from_secs(cli.shutdown_timeout),
    };

    let shutdown = Arc::new(Notify::new());
    spawn_signal_handler("sync-worker", shutdown.clone());
    WorkerRunner::run(worker, Arc::new(queue), runner_config, shutdown).await;
    Ok(())
}

/// `worker-<hostname>`, stable across restarts on the same host.
fn host_worker_id() -> anyhow::Result<String> {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());
    match host {
        Some(h) => Ok(format!("worker-{h}")),
        None => bail!("no host name available; set --worker-id or SYNC_WORKER_ID"),
    }
}
