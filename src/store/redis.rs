//! Redis-backed [`Store`] implementation on top of a `fred` client pool.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use fred::clients::Pool;
use fred::error::ErrorKind;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig};
use fred::types::{Builder, Expiration};

use crate::config::RedisConfig;
use crate::store::{Store, StoreError};

/// Create a Redis connection pool from the application configuration.
///
/// The pool is initialised (connected + PING verified) before being
/// returned, so a bad address or password fails at startup instead of on
/// the first session.
pub async fn create_redis_pool(config: &RedisConfig) -> Result<Pool> {
    let server = ServerConfig::new_centralized(config.host.as_str(), config.port);

    let mut fred_config = FredConfig {
        server,
        database: Some(config.db),
        ..FredConfig::default()
    };

    if let Some(ref password) = config.password {
        fred_config.password = Some(password.clone());
    }

    let mut builder = Builder::from_config(fred_config);

    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(4)
        .context("failed to build redis connection pool")?;

    pool.init().await.context("failed to connect to redis")?;

    let _: String = pool
        .ping(None)
        .await
        .context("redis PING failed after connect")?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        db = config.db,
        "redis pool created and verified"
    );

    Ok(pool)
}

/// [`Store`] over a shared `fred` pool. The pool is clone-cheap and
/// thread-safe; one `RedisStore` serves both planes.
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Classify a fred error. Connectivity-shaped failures are transient
/// `Backend` errors; anything else means we spoke the protocol wrong and is
/// fatal to the calling session.
fn classify(err: fred::error::Error) -> StoreError {
    let transient = matches!(
        err.kind(),
        ErrorKind::IO | ErrorKind::Timeout | ErrorKind::Canceled | ErrorKind::Backpressure
    );
    if transient {
        StoreError::Backend(err)
    } else {
        StoreError::Protocol(err)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let expiration = ttl.map(|d| Expiration::EX(d.as_secs() as i64));
        self.pool
            .set::<(), _, _>(key, Bytes::copy_from_slice(value), expiration, None, false)
            .await
            .map_err(classify)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let value: Option<Vec<u8>> = self.pool.get(key).await.map_err(classify)?;
        value.ok_or(StoreError::KeyNotFound)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let _: u64 = self.pool.del(key).await.map_err(classify)?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.pool.incr(key).await.map_err(classify)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let _: bool = self
            .pool
            .expire(key, ttl.as_secs() as i64, None)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
