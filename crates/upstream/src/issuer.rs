use async_trait::async_trait;
use chrono::Utc;

use feedsync_core::config::UpstreamConfig;
use feedsync_lease::{CredentialIssuer, IssuedCredential, LeaseError};

use crate::client::FeedApiClient;
use crate::error::UpstreamError;

/// Issues pool credentials through the API's password-grant endpoint.
pub struct PasswordGrantIssuer {
    client: FeedApiClient,
    username: String,
    password: String,
}

impl PasswordGrantIssuer {
    pub fn new(
        client: FeedApiClient,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {

        Self {
            client,
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let (Some(user), Some(pass)) = (&config.username, &config.password) else {
            return Err(UpstreamError::Parse(
                "FEED_API_USERNAME and FEED_API_PASSWORD must be set".into(),
            ));
        };
        Ok(Self::new(FeedApiClient::from_config(config)?, user.clone(), pass.clone()))
    }
}

fn to_lease_error(e: UpstreamError) -> LeaseError {
    LeaseError::Issuer(e.to_string())
}

#[async_trait]
impl CredentialIssuer for PasswordGrantIssuer {
    async fn issue(&self) -> Result<IssuedCredential, LeaseError> {
        let issued_at = Utc::now();
        let token = self
            .client
            .request_token(&self.username, &self.password)
            .await
            .map_err(to_lease_error)?;
        Ok(IssuedCredential {
            token: token.access_token,
            expires_in: token.expires_in,
            issued_at,
        })
    }

    async fn release(&self, token: &str) -> Result<(), LeaseError> {
        self.client.release_token(token).await.map_err(to_lease_error)
    }
}
