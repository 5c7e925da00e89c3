//! Per-source admission control.
//!
//! A fixed-window counter in shared storage, keyed by a caller-supplied
//! identifier (the SSH plane uses the client IP). The limiter is soft: two
//! concurrent callers can both observe count 99 and both be admitted, which
//! is accepted — correctness here is not worth serializing every session
//! through a lock.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::store::{Store, StoreError};

/// Admissions allowed per source per window.
pub const MAX_ATTEMPTS: i64 = 100;

/// Width of the fixed admission window.
pub const WINDOW: Duration = Duration::from_secs(60 * 60);

const KEY_PREFIX: &str = "rate_limiter";

pub struct RateLimiter {
    store: Arc<dyn Store>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn storage_key(id: &str) -> String {
        format!("{KEY_PREFIX}:{id}")
    }

    /// Check and record one admission attempt for `id`.
    ///
    /// Sources at or past [`MAX_ATTEMPTS`] are refused without incrementing,
    /// so being refused does not push the window forward. The TTL is set
    /// only when the increment created the key (post-increment value 1),
    /// which is what makes the window fixed rather than sliding.
    pub async fn is_rate_limited(&self, id: &str) -> Result<bool> {
        let key = Self::storage_key(id);

        let count = match self.store.get(&key).await {
            Ok(raw) => std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .with_context(|| format!("admission counter {key:?} is not an integer"))?,
            Err(StoreError::KeyNotFound) => 0,
            Err(err) => return Err(err).context("failed to read admission counter"),
        };

        if count >= MAX_ATTEMPTS {
            return Ok(true);
        }

        let value = self
            .store
            .incr(&key)
            .await
            .context("failed to increment admission counter")?;
        if value == 1 {
            self.store
                .expire(&key, WINDOW)
                .await
                .context("failed to set admission window TTL")?;
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn limiter() -> (Arc<MemoryStore>, RateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(Arc::clone(&store) as Arc<dyn Store>);
        (store, limiter)
    }

    #[tokio::test]
    async fn first_attempt_is_admitted_and_window_ttl_is_set() {
        let (store, limiter) = limiter();

        assert!(!limiter.is_rate_limited("10.0.0.1").await.unwrap());
        assert_eq!(
            store.get("rate_limiter:10.0.0.1").await.unwrap(),
            b"1".to_vec()
        );
        assert_eq!(store.ttl_of("rate_limiter:10.0.0.1"), Some(WINDOW));
    }

    #[tokio::test]
    async fn ttl_is_only_set_on_the_create_step() {
        let (store, limiter) = limiter();

        for _ in 0..3 {
            assert!(!limiter.is_rate_limited("10.0.0.2").await.unwrap());
        }
        // A second set would have replaced the recorded TTL with the same
        // value; instead we assert the counter advanced without a reset by
        // expiring through a different window first.
        store
            .expire("rate_limiter:10.0.0.2", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!limiter.is_rate_limited("10.0.0.2").await.unwrap());
        assert_eq!(store.ttl_of("rate_limiter:10.0.0.2"), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn cap_refuses_without_incrementing() {
        let (store, limiter) = limiter();

        for attempt in 0..MAX_ATTEMPTS {
            assert!(
                !limiter.is_rate_limited("10.0.0.3").await.unwrap(),
                "attempt {attempt} should be admitted"
            );
        }

        assert!(limiter.is_rate_limited("10.0.0.3").await.unwrap());
        assert!(limiter.is_rate_limited("10.0.0.3").await.unwrap());

        // Refusals park the counter at the cap instead of pushing it past.
        assert_eq!(
            store.get("rate_limiter:10.0.0.3").await.unwrap(),
            MAX_ATTEMPTS.to_string().into_bytes()
        );
    }

    #[tokio::test]
    async fn sources_are_isolated() {
        let (_store, limiter) = limiter();

        for _ in 0..MAX_ATTEMPTS {
            limiter.is_rate_limited("10.0.0.4").await.unwrap();
        }
        assert!(limiter.is_rate_limited("10.0.0.4").await.unwrap());
        assert!(!limiter.is_rate_limited("10.0.0.5").await.unwrap());
    }
}
