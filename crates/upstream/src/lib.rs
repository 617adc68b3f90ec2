//! Client for the upstream stream-data API.

pub mod client;
pub mod error;
pub mod issuer;
pub mod payload;

pub use client::{FeedApiClient, FeedSource, StreamRequest};
pub use error::UpstreamError;
pub use issuer::PasswordGrantIssuer;
pub use payload::{ColumnInfo, StreamMetadata, StreamPayload};
