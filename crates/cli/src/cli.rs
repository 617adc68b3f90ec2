use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

/// Operator tool for the feed sync engine.
///
/// Every command runs once against the configured Postgres and Redis and
/// prints JSON.
#[derive(Parser, Debug)]
#[command(name = "feedsync", version, about = "Operator tool for the feed sync engine")]
pub struct CliArgs {
    /// Config profile; keys resolve as `{PROFILE}_{KEY}` before `{KEY}`.
    #[arg(long, env = "FEEDSYNC_PROFILE", default_value = "")]
    pub profile: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one scheduling tick now.
    Tick,

    /// Requeue jobs that failed within the lookback window.
    RetryFailed {
        /// Lookback in hours; defaults to SYNC_RETRY_WINDOW_HOURS.
        #[arg(long)]
        window_hours: Option<u32>,
    },

    /// Halt all scheduling and flag the credential pool.
    PauseAll,

    /// Undo `pause-all`.
    ResumeAll,

    /// Reopen and immediately schedule a feed's catch-up.
    Catchup {
        #[arg(long)]
        feed_id: i64,
    },

    /// Show a feed's sync state, gaps and recent jobs.
    Feed {
        #[arg(long)]
        feed_id: i64,

        /// Recent jobs to include.
        #[arg(long, default_value_t = 20)]
        jobs: i64,
    },

    /// List tracked feeds.
    Feeds,

    /// Show one job.
    Job {
        #[arg(long)]
        job_id: Uuid,
    },

    /// Credential pool record, live leases and recent lease durations.
    PoolStatus,

    /// Start tracking an upstream stream, or update it if already tracked.
    Track(TrackArgs),

    /// Turn steady-state polling on or off for a feed.
    SetSyncActive {
        #[arg(long)]
        feed_id: i64,

        #[arg(long, action = clap::ArgAction::Set)]
        active: bool,
    },

    /// Stop syncing a feed for good. Its rows and history are kept.
    Deactivate {
        #[arg(long)]
        feed_id: i64,
    },

    /// Print the resolved configuration with secrets redacted.
    Config,
}

#[derive(Args, Debug)]
pub struct TrackArgs {
    #[arg(long)]
    pub stream_id: i64,

    #[arg(long, default_value = "feature")]
    pub perspective: String,

    #[arg(long, default_value = "")]
    pub data_option: String,

    #[arg(long)]
    pub iso: String,

    #[arg(long)]
    pub name: Option<String>,

    /// IANA timezone the stream publishes in.
    #[arg(long, default_value = "UTC")]
    pub tz: String,

    /// Native interval, e.g. `15` or `15min`.
    #[arg(long, default_value = "60")]
    pub freq: String,

    /// First date upstream has data for (`YYYY-MM-DD` or a full timestamp).
    #[arg(long)]
    pub available_from: Option<String>,

    /// Earliest date to backfill to.
    #[arg(long)]
    pub target_first_date: Option<String>,

    /// Warehouse table; defaults to `<iso>_fcst` or `<iso>_feature`.
    #[arg(long)]
    pub table: Option<String>,

    /// Poll for new data on the steady schedule, not just catch up.
    #[arg(long, default_value_t = false)]
    pub sync_active: bool,

    #[arg(long, default_value_t = 0)]
    pub priority: i32,

    /// Also start a cadence estimator for the feed.
    #[arg(long, default_value_t = false)]
    pub estimate: bool,
}
