//! Shared upstream credentials leased to concurrent workers.
//!
//! Coordination is advisory: TTL-bounded usage records are counted against
//! the pool's `max_users`, and a crashed holder's lease simply expires.

pub mod error;
pub mod issuer;
pub mod keeper;
pub mod pool;
pub mod redis_store;
pub mod store;
pub mod switch;

pub use error::LeaseError;
pub use issuer::{CredentialIssuer, IssuedCredential};
pub use keeper::run_token_keeper;
pub use pool::{CredentialLeasePool, LeaseDuration, PoolRecord, RefreshOutcome};
pub use redis_store::RedisStore;
pub use store::{CoordinationStore, MemoryStore};
pub use switch::SyncSwitch;
