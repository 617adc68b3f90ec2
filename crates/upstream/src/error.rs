use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("credential rejected (status {status})")]
    AuthRejected { status: u16 },

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl UpstreamError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRejected { .. })
    }
}
