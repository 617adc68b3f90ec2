use thiserror::Error;
use uuid::Uuid;

use feedsync_core::CoreError;
use feedsync_lease::LeaseError;
use feedsync_queue::QueueError;
use feedsync_upstream::UpstreamError;

/// Failures of the feed/job/estimator stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("feed not found: {0}")]
    FeedNotFound(i64),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("duplicate feed: {0}")]
    DuplicateFeed(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("store lock poisoned")]
    Poisoned,
}

impl From<CoreError> for StoreError {
    fn from(e: CoreError) -> Self {
        Self::Invalid(e.to_string())
    }
}

/// Failures while loading rows into the warehouse.
#[derive(Error, Debug)]
pub enum WarehouseError {
    /// Uniqueness or cardinality violation during the merge.
    #[error("merge conflict on {table}: {message}")]
    Conflict { table: String, message: String },

    #[error("invalid warehouse table name: {0}")]
    InvalidTable(String),

    #[error("warehouse database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("warehouse lock poisoned")]
    Poisoned,
}

/// Problems with the data upstream handed back.
#[derive(Error, Debug)]
pub enum UpstreamDataError {
    #[error("upstream returned no rows for {window}")]
    EmptyResult { window: String },

    #[error("expected {expected} columns, got {actual}")]
    SchemaMismatch { expected: usize, actual: usize },

    #[error("row {row}: {detail}")]
    Malformed { row: usize, detail: String },

    #[error("feed data starts at {available_from}, requested window ends {requested_end}")]
    NotYetAvailable {
        available_from: String,
        requested_end: String,
    },
}

/// Everything that can fail a sync job.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("credential error: {0}")]
    Credential(#[from] LeaseError),

    #[error("upstream data error: {0}")]
    UpstreamData(#[from] UpstreamDataError),

    #[error("load error: {0}")]
    Load(#[from] WarehouseError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("upstream error: {0}")]
    Upstream(UpstreamError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("{0}")]
    Core(#[from] CoreError),
}

impl From<UpstreamError> for SyncError {
    /// Auth rejections count as credential failures.
    fn from(e: UpstreamError) -> Self {
        if e.is_auth() {
            Self::Credential(LeaseError::Issuer(e.to_string()))
        } else {
            Self::Upstream(e)
        }
    }
}

impl SyncError {
    /// Short category label used in logs and `last_error`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Credential(_) => "credential",
            Self::UpstreamData(_) => "upstream_data",
            Self::Load(_) => "load",
            Self::Store(_) => "store",
            Self::Upstream(_) => "upstream",
            Self::Queue(_) => "queue",
            Self::Core(_) => "core",
        }
    }
}

/// Postgres error codes the merge treats as key conflicts.
pub(crate) const UNIQUE_VIOLATION: &str = "23505";
pub(crate) const CARDINALITY_VIOLATION: &str = "21000";

/// Map a merge failure, singling out uniqueness/cardinality violations.
pub(crate) fn classify_merge_error(e: sqlx::Error, table: &str) -> WarehouseError {
    if let sqlx::Error::Database(ref db_err) = e {
        if let Some(code) = db_err.code() {
            if code == UNIQUE_VIOLATION || code == CARDINALITY_VIOLATION {
                return WarehouseError::Conflict {
                    table: table.to_string(),
                    message: db_err.message().to_string(),
                };
            }
        }
    }
    WarehouseError::Database(e)
}

/// Map a unique violation on the feeds natural key.
pub(crate) fn map_unique_violation(e: sqlx::Error, key: &str) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::DuplicateFeed(key.to_string());
        }
    }
    StoreError::Database(e)
}
