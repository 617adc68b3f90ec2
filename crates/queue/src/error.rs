use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unreachable: {0}")]
    Unreachable(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    /// The delivery was already settled or recovered by another consumer.
    #[error("delivery not held by this consumer: {0}")]
    NotHeld(String),

    #[error("envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    /// Failures that may clear up on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unreachable(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_io_error()
        {

            QueueError::Unreachable(e.to_string())
        } else {
            QueueError::Backend(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_transient() {
        assert!(QueueError::Unreachable("refused".into()).is_transient());
        assert!(!QueueError::NotHeld("r-1".into()).is_transient());
        assert!(!QueueError::Malformed("{".into()).is_transient());
    }
}
