use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::debug;

use feedsync_core::config::UpstreamConfig;

use crate::error::UpstreamError;
use crate::payload::{StreamMetadata, StreamPayload};

const TOKEN_PATH: &str = "/api/security/token";
const RELEASE_PATH: &str = "/api/ReleaseToken";
const JSON_FORMAT: &str = "application/json";

/// Wall-clock layout the API accepts for `fromDate`/`toDate`.
const QUERY_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One stream-data request. Dates are in the stream's own timezone.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub stream_id: i64,
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
    pub data_option: Option<String>,
}

impl StreamRequest {
    fn query(&self) -> Vec<(&'static str, String)> {
        let mut q = vec![
            ("fromDate", self.from.format(QUERY_DATE_FORMAT).to_string()),
            ("toDate", self.to.format(QUERY_DATE_FORMAT).to_string()),
            ("dataFormat", JSON_FORMAT.to_string()),
        ];
        if let Some(opt) = self.data_option.as_deref().filter(|o| !o.is_empty()) {
            q.push(("dataOption", opt.to_string()));
        }
        q
    }
}

/// Data access the engine needs from upstream. Every call carries a leased token.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(
        &self,
        token: &str,
        request: &StreamRequest,
    ) -> Result<StreamPayload, UpstreamError>;

    /// Small request whose only purpose is reading stream metadata.
    async fn probe(
        &self,
        token: &str,
        request: &StreamRequest,
    ) -> Result<StreamMetadata, UpstreamError> {
        Ok(self.fetch(token, request).await?.metadata)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
}

/// reqwest-backed client for the feed API.
#[derive(Debug, Clone)]
pub struct FeedApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl FeedApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        Self::new(config.base_url.clone(), config.timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(response),
            401 | 403 => Err(UpstreamError::AuthRejected { status }),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(UpstreamError::Api { status, body })
            }
        }
    }

    /// Password grant; returns the raw token response.
    pub(crate) async fn request_token(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenResponse, UpstreamError> {
        let form = [
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ];
        let response = self.client.post(self.url(TOKEN_PATH)).form(&form).send().await?;
        let token: TokenResponse = Self::check(response).await?.json().await?;
        debug!(expires_in = token.expires_in, "upstream token issued");
        Ok(token)
    }

    pub async fn release_token(&self, token: &str) -> Result<(), UpstreamError> {
        let response = self
            .client
            .delete(self.url(RELEASE_PATH))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl FeedSource for FeedApiClient {
    async fn fetch(
        &self,
        token: &str,
        request: &StreamRequest,
    ) -> Result<StreamPayload, UpstreamError> {
        let url = self.url(&format!("/api/StreamData/{}", request.stream_id));
        debug!(
            stream_id = request.stream_id,
            from = %request.from,
            to = %request.to,
            "requesting stream data"
        );
        let response = self
            .client
            .get(&url)
            .query(&request.query())
            .header(reqwest::header::ACCEPT, JSON_FORMAT)
            .bearer_auth(token)
            .send()
            .await?;
        let body = Self::check(response).await?.text().await?;
        if body.trim().is_empty() {
            // The API answers an empty range with an empty body.
            return Ok(StreamPayload::default());
        }
        StreamPayload::from_json(&body)
    }
}
