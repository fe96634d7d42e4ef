//! Cart cache abstraction.
//!
//! The cache is a disposable accelerator in front of the cart store. Keys are the
//! raw user id and values are the JSON [`CartView`](crate::cart::CartView). Every
//! write sets an absolute expiry; reads never extend it.
//!
//! Implementations must bound every call by a client-side timeout and report
//! unavailability as [`CacheError`] rather than blocking. Callers treat all cache
//! errors as non-fatal.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by cache implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cache could not be reached
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured timeout
    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    /// The cache answered with an error
    #[error("Cache operation failed: {0}")]
    Operation(String),
}

/// String-keyed cache with absolute expiry.
pub trait CartCache: Send + Sync {
    /// Reads a value. `Ok(None)` is a miss.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache cannot be read.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, CacheError>> + Send;

    /// Writes a value that expires `ttl` after this call.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the write fails.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Removes a value. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the delete fails.
    fn remove(&self, key: &str) -> impl Future<Output = Result<(), CacheError>> + Send;
}
