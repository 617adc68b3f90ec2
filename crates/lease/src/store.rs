//! Coordination store abstraction and its in-memory backend.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::LeaseError;

/// Key-value store with per-key TTL and atomic hash updates.
///
/// Every operation is atomic per key; nothing here takes a lock across keys.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, LeaseError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), LeaseError>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LeaseError>;
    async fn exists(&self, key: &str) -> Result<bool, LeaseError>;
    async fn delete(&self, key: &str) -> Result<(), LeaseError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), LeaseError>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, LeaseError>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, LeaseError>;
    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), LeaseError>;
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, LeaseError>;

    /// Keys matching a glob pattern where `*` matches any run of characters.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, LeaseError>;
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

/// Process-local store. Expired keys vanish on the next access.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T, LeaseError>,
    ) -> Result<T, LeaseError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| LeaseError::Store("memory store lock poisoned".into()))?;
        let now = Instant::now();
        guard.retain(|_, e| e.is_live(now));
        f(&mut guard)
    }
}

fn wrong_type(key: &str) -> LeaseError {
    LeaseError::Store(format!("WRONGTYPE operation against key {key}"))
}

pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LeaseError> {
        self.with_entries(|m| match m.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::Hash(_)) => Err(wrong_type(key)),
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), LeaseError> {
        self.with_entries(|m| {
            m.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: None,
                },
            );
            Ok(())
        })
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LeaseError> {
        self.with_entries(|m| {
            m.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, LeaseError> {
        self.with_entries(|m| Ok(m.contains_key(key)))
    }

    async fn delete(&self, key: &str) -> Result<(), LeaseError> {
        self.with_entries(|m| {
            m.remove(key);
            Ok(())
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), LeaseError> {
        self.with_entries(|m| {
            if let Some(e) = m.get_mut(key) {
                e.expires_at = Some(Instant::now() + ttl);
            }
            Ok(())
        })
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, LeaseError> {
        self.with_entries(|m| match m.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(Value::Str(_)) => Err(wrong_type(key)),
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, LeaseError> {
        self.with_entries(|m| match m.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(Value::Str(_)) => Err(wrong_type(key)),
        })
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), LeaseError> {
        self.with_entries(|m| {
            let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(h) => {
                    for (f, v) in fields {
                        h.insert((*f).to_string(), v.clone());
                    }
                    Ok(())
                }
                Value::Str(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, LeaseError> {
        self.with_entries(|m| {
            let entry = m.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(h) => {
                    let current = match h.get(field) {
                        Some(v) => v.parse::<i64>().map_err(|_| {
                            let msg = format!("hash value is not an integer: {key}.{field}");
                            LeaseError::Store(msg)
                        })?,

                        None => 0,
                    };
                    let next = current + delta;
                    h.insert(field.to_string(), next.to_string());
                    Ok(next)
                }
                Value::Str(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, LeaseError> {
        self.with_entries(|m| {
            let mut keys: Vec<String> =
                m.keys().filter(|k| glob_match(pattern, k)).cloned().collect();

            keys.sort();
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("pool:lease:*", "pool:lease:w1"));
        assert!(!glob_match("pool:lease:*", "pool:duration:w1"));
        assert!(glob_match("*:live", "pool:live"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(!glob_match("a*c*e", "abcd"));
        assert!(glob_match("exact", "exact"));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store.set_with_ttl("k", "v", Duration::from_millis(30)).await.unwrap();
        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hash_incr_and_type_errors() {
        let store = MemoryStore::new();
        assert_eq!(store.hash_incr("h", "n", 2).await.unwrap(), 2);
        assert_eq!(store.hash_incr("h", "n", -1).await.unwrap(), 1);
        assert_eq!(store.hash_get("h", "n").await.unwrap().as_deref(), Some("1"));

        store.set("s", "x").await.unwrap();
        assert!(store.hash_get("s", "n").await.is_err());
        assert!(store.get("h").await.is_err());
    }

    #[tokio::test]
    async fn test_scan_keys_sorted() {
        let store = MemoryStore::new();
        store.set("p:lease:b", "1").await.unwrap();
        store.set("p:lease:a", "1").await.unwrap();
        store.set("p:live", "1").await.unwrap();
        assert_eq!(store.scan_keys("p:lease:*").await.unwrap(), vec!["p:lease:a", "p:lease:b"]);
    }
}
