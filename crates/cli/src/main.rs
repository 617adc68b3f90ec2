mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use feedsync_core::config::{load_dotenv, Config};

use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )

        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = Config::for_profile(&args.profile);
    let output = commands::run(&config, args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
