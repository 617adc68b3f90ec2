use std::sync::Arc;

use tracing::warn;

use crate::error::LeaseError;
use crate::store::CoordinationStore;

/// Default key for the global sync flag.
pub const SYNC_ACTIVE_KEY: &str = "feedsync:sync_active";

/// Global on/off flag for the whole sync subsystem.
///
/// An absent flag counts as active; only an explicit `"0"` halts scheduling.
#[derive(Clone)]
pub struct SyncSwitch {
    store: Arc<dyn CoordinationStore>,
    key: String,
}

impl SyncSwitch {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            key: SYNC_ACTIVE_KEY.to_string(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub async fn is_active(&self) -> Result<bool, LeaseError> {
        Ok(self.store.get(&self.key).await?.as_deref() != Some("0"))
    }

    pub async fn set_active(&self, active: bool) -> Result<(), LeaseError> {
        if !active {
            warn!(key = %self.key, "sync subsystem switched off");
        }
        self.store.set(&self.key, if active { "1" } else { "0" }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_absent_flag_is_active() {
        let switch = SyncSwitch::new(Arc::new(MemoryStore::new()));
        assert!(switch.is_active().await.unwrap());
        switch.set_active(false).await.unwrap();
        assert!(!switch.is_active().await.unwrap());
        switch.set_active(true).await.unwrap();
        assert!(switch.is_active().await.unwrap());
    }
}
