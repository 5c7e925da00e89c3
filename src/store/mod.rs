//! Typed key/value storage abstraction.
//!
//! Everything the service persists — snippet blobs, the site-wide upload
//! counter, and the per-source admission counters — goes through the
//! [`Store`] trait so that callers never touch the backend client directly.
//! Absent keys are a first-class, recoverable condition ([`StoreError::
//! KeyNotFound`]), never a stringly-typed error.

pub mod redis;

#[cfg(test)]
pub(crate) mod memory;

use std::time::Duration;

use async_trait::async_trait;

/// Key of the site-wide, never-expiring upload counter.
pub const CODE_UPLOADED_COUNT_KEY: &str = "code_uploaded_count";

/// Errors surfaced by [`Store`] implementations.
///
/// `KeyNotFound` is always handled locally by callers (404 / "0" /
/// "not rate-limited" semantics). `Backend` errors are transient and
/// retryable at the caller's discretion; `Protocol` errors are fatal to the
/// session or request that hit them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found")]
    KeyNotFound,
    #[error("storage backend error")]
    Backend(#[source] fred::error::Error),
    #[error("storage protocol error")]
    Protocol(#[source] fred::error::Error),
}

/// TTL-capable key/value store with atomic increment.
#[async_trait]
pub trait Store: Send + Sync {
    /// Overwrite `key` with `value`. `Some(ttl)` sets an expiry; `None`
    /// stores without one.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Fetch the value under `key`. Absent keys yield
    /// [`StoreError::KeyNotFound`].
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Delete `key`. Deleting an absent key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically increment the integer under `key`, initializing it to 1
    /// when absent. Returns the post-increment value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set or reset the TTL on an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}
