//! In-memory [`Store`] used by unit tests. TTLs are recorded, not enforced.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::store::{Store, StoreError};

#[derive(Default)]
pub(crate) struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    ttls: Mutex<HashMap<String, Duration>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// TTL most recently recorded for `key` by `set` or `expire`.
    pub(crate) fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.ttls.lock().get(key).copied()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        if let Some(ttl) = ttl {
            self.ttls.lock().insert(key.to_string(), ttl);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or(StoreError::KeyNotFound)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        self.ttls.lock().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock();
        let current = entries
            .get(key)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        entries.insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.ttls.lock().insert(key.to_string(), ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_initializes_to_one_and_counts_up() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn get_absent_key_is_key_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("missing").await,
            Err(StoreError::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn del_removes_the_entry() {
        let store = MemoryStore::new();
        store.set("k", b"v", None).await.unwrap();
        store.del("k").await.unwrap();
        assert!(matches!(store.get("k").await, Err(StoreError::KeyNotFound)));
    }
}
