use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("credential pool not found: {0}")]
    PoolNotFound(String),

    #[error("timed out waiting for a lease on {pool} after {retries} retries")]
    LeaseTimeout { pool: String, retries: u32 },

    #[error("pool {pool} still paused after {waited_secs}s")]
    PauseTimeout { pool: String, waited_secs: u64 },

    #[error("coordination store error: {0}")]
    Store(String),

    #[error("credential issuer error: {0}")]
    Issuer(String),

    #[error("corrupt pool record: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for LeaseError {
    fn from(e: redis::RedisError) -> Self {
        LeaseError::Store(e.to_string())
    }
}
