//! Redis cart cache for the cart checkout pipeline.
//!
//! Entries are stored under the raw user id with `SET key value EX ttl`; reads are
//! plain `GET`s and never touch the expiry, so every entry expires a fixed time
//! after its last write.
//!
//! Every command is bounded by [`RedisCacheConfig::operation_timeout`]. A slow or
//! unreachable Redis surfaces as [`CacheError`] quickly, and the cart service
//! falls back to the store.
//!
//! # Example
//!
//! ```no_run
//! use cartflow_redis::{RedisCacheConfig, RedisCartCache};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RedisCartCache::connect(RedisCacheConfig::new("redis://127.0.0.1:6379")).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use cartflow_core::{CacheError, CartCache};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use std::future::Future;
use std::time::Duration;

/// Default bound on a single cache command.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(250);

/// Default bound on establishing the initial connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisCacheConfig {
    /// Redis connection URL (e.g. `redis://127.0.0.1:6379`)
    pub url: String,
    /// Bound on each GET / SET / DEL
    pub operation_timeout: Duration,
    /// Bound on the initial connection
    pub connect_timeout: Duration,
}

impl RedisCacheConfig {
    /// Create a configuration with default timeouts
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the per-command timeout
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Redis-backed [`CartCache`].
///
/// Cloning is cheap; clones share the underlying multiplexed connection, which
/// reconnects on its own after Redis comes back.
#[derive(Clone)]
pub struct RedisCartCache {
    conn_manager: ConnectionManager,
    operation_timeout: Duration,
}

impl std::fmt::Debug for RedisCartCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCartCache")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisCartCache {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Unavailable`] if the URL is invalid or the connection fails
    /// - [`CacheError::Timeout`] if the connection is not established in time
    pub async fn connect(config: RedisCacheConfig) -> Result<Self, CacheError> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            CacheError::Unavailable(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout(config.connect_timeout))?
            .map_err(|e| {
                CacheError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
            })?;

        tracing::info!(
            operation_timeout_ms = config.operation_timeout.as_millis(),
            "Connected to Redis cart cache"
        );

        Ok(Self {
            conn_manager,
            operation_timeout: config.operation_timeout,
        })
    }

    async fn bounded<T>(
        &self,
        command: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.operation_timeout, command)
            .await
            .map_err(|_| CacheError::Timeout(self.operation_timeout))?
            .map_err(map_redis_error)
    }
}

impl CartCache for RedisCartCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn_manager.clone();
        self.bounded(conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let ttl_seconds = ttl_seconds(ttl);
        self.bounded(conn.set_ex::<_, _, ()>(key, value, ttl_seconds))
            .await?;
        tracing::trace!(key, ttl_seconds, "Cart cached");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        self.bounded(conn.del::<_, ()>(key)).await
    }
}

/// Redis expiries are whole seconds and must be positive.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[allow(clippy::needless_pass_by_value)] // Used as `map_err(map_redis_error)`
fn map_redis_error(e: RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        CacheError::Unavailable(e.to_string())
    } else if e.is_timeout() {
        CacheError::Operation(format!("Redis timed out: {e}"))
    } else {
        CacheError::Operation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = RedisCacheConfig::new("redis://localhost:6379");
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));

        let config = config.with_operation_timeout(Duration::from_millis(50));
        assert_eq!(config.operation_timeout, Duration::from_millis(50));
    }

    #[test]
    fn ttl_is_whole_positive_seconds() {
        assert_eq!(ttl_seconds(Duration::from_secs(86_400)), 86_400);
        assert_eq!(ttl_seconds(Duration::from_millis(1500)), 1);
        assert_eq!(ttl_seconds(Duration::ZERO), 1);
    }

    #[test]
    fn io_errors_mean_unavailable() {
        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(map_redis_error(io), CacheError::Unavailable(_)));

        let typed = RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        assert!(matches!(map_redis_error(typed), CacheError::Operation(_)));
    }

    #[tokio::test]
    async fn connect_rejects_invalid_url() {
        let result = RedisCartCache::connect(RedisCacheConfig::new("not a url")).await;
        assert!(matches!(result, Err(CacheError::Unavailable(_))));
    }
}
