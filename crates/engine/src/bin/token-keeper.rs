//! The single maintenance process for the credential pool.
//!
//! Creates the pool when missing and rotates the credential before it
//! expires. Repeated failures switch the sync subsystem off.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

use feedsync_core::config::{load_dotenv, Config};
use feedsync_engine::spawn_signal_handler;
use feedsync_lease::{run_token_keeper, CredentialLeasePool, RedisStore, SyncSwitch};
use feedsync_upstream::PasswordGrantIssuer;

#[derive(Parser, Debug)]
#[command(name = "token-keeper", version, about)]
struct Cli {
    /// Create the pool if needed, then exit.
    #[arg(long, default_value_t = false)]
    init_only: bool,
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
    anyhow::ensure!(
        config.upstream.is_configured(),
        "FEED_API_USERNAME and FEED_API_PASSWORD must be set"
    );

    let store = Arc::new(
        RedisStore::connect(&config.redis.url)
            .await
            .context("coordination store")?,
    );
    let issuer =
        PasswordGrantIssuer::from_config(&config.upstream).context("credential issuer")?;
    let issuer = Arc::new(issuer);
    let pool = CredentialLeasePool::new(store.clone(), config.lease.clone(), "token-keeper");
    let switch = SyncSwitch::new(store);

    if cli.init_only {
        let outcome = pool.refresh(issuer.as_ref(), &switch).await?;
        info!(pool = %pool.pool_name(), ?outcome, "pool checked");
        return Ok(());
    }

    let shutdown = Arc::new(Notify::new());
    spawn_signal_handler("token-keeper", shutdown.clone());
    run_token_keeper(
        pool,
        issuer,
        switch,
        shutdown,
        config.lease.refresh_check(),
        config.lease.max_refresh_failures,
    )
    .await?;
    Ok(())
}
