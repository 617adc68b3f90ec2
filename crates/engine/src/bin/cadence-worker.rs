//! Probes upstream metadata until each feed's cadence settles.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

use feedsync_core::config::{load_dotenv, Config};
use feedsync_engine::store::{PgEstimatorStore, PgFeedStore};
use feedsync_engine::{init_pg_pool, run_cadence_loop, spawn_signal_handler, CadenceEstimator};
use feedsync_lease::{CredentialLeasePool, RedisStore};
use feedsync_upstream::FeedApiClient;

#[derive(Parser, Debug)]
#[command(name = "cadence-worker", version, about)]
struct Cli {
    /// Lease identity for metadata probes.
    #[arg(long, env = "CADENCE_WORKER_ID", default_value = "cadence")]
    worker_id: String,

    /// Start estimating these feeds before polling.
    #[arg(long = "feed-id")]
    feed_ids: Vec<i64>,

    /// Run one pass over due estimators and exit.
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
    let source = FeedApiClient::from_config(&config.upstream).context("upstream client")?;

    let estimator = Arc::new(CadenceEstimator::new(
        Arc::new(PgFeedStore::new(pg.clone())),
        Arc::new(PgEstimatorStore::new(pg)),
        Arc::new(source),
        CredentialLeasePool::new(store, config.lease.clone(), cli.worker_id),
        config.cadence.clone(),
    ));

    for feed_id in &cli.feed_ids {
        let state = estimator.ensure_estimator(*feed_id).await?;
        info!(feed_id, next_run = %state.next_run, "estimator ready");
    }

    if cli.once {
        let report = estimator.run_due(Utc::now()).await?;
        info!(
            probed = report.probed,
            settled = report.settled,
            failures = report.failures,
            "cadence pass complete"
        );
        return Ok(());
    }

    let shutdown = Arc::new(Notify::new());
    spawn_signal_handler("cadence-worker", shutdown.clone());
    let poll = Duration::from_secs(config.cadence.poll_secs.max(1));
    run_cadence_loop(estimator, poll, shutdown).await;
    Ok(())
}
