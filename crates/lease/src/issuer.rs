use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::LeaseError;

/// A freshly issued upstream credential.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub token: String,
    /// Lifetime in seconds as reported by the issuer.
    pub expires_in: i64,
    pub issued_at: DateTime<Utc>,
}

impl IssuedCredential {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + TimeDelta::seconds(self.expires_in)
    }
}

/// Source of upstream credentials. Only the maintenance process issues or
/// releases; data workers just read the pooled token.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self) -> Result<IssuedCredential, LeaseError>;

    /// Revoke a credential upstream. Releasing an already expired token is not an error.
    async fn release(&self, token: &str) -> Result<(), LeaseError>;
}
