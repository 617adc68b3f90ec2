use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("invalid job status: {0}")]
    InvalidStatus(String),

    #[error("invalid date window: {start} >= {end}")]
    InvalidWindow { start: String, end: String },

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("{0}")]
    Other(String),
}
