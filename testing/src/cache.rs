//! In-memory cart cache.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use cartflow_core::{CacheError, CartCache};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, (String, Duration)>,
    unavailable: bool,
    fail_writes: bool,
    hits: u64,
    misses: u64,
}

/// HashMap-backed [`CartCache`].
///
/// Expiry is recorded, not enforced: tests read it back with [`ttl`](Self::ttl).
#[derive(Clone, Debug, Default)]
pub struct InMemoryCartCache {
    state: Arc<RwLock<CacheState>>,
}

impl InMemoryCartCache {
    /// Create a new empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a raw value, bypassing failure injection (e.g. to plant corrupt JSON)
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.state
            .write()
            .unwrap()
            .entries
            .insert(key.to_string(), (value.to_string(), Duration::ZERO));
    }

    /// Raw value for `key`, bypassing failure injection
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.state
            .read()
            .unwrap()
            .entries
            .get(key)
            .map(|(value, _)| value.clone())
    }

    /// Expiry the last write for `key` requested
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.state.read().unwrap().entries.get(key).map(|(_, ttl)| *ttl)
    }

    /// Whether `key` is cached
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.state.read().unwrap().entries.contains_key(key)
    }

    /// Simulate the cache being unreachable for every operation
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.write().unwrap().unavailable = unavailable;
    }

    /// Fail writes and deletes only; reads keep working
    pub fn fail_writes(&self, fail: bool) {
        self.state.write().unwrap().fail_writes = fail;
    }

    /// `(hits, misses)` served so far
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        let state = self.state.read().unwrap();
        (state.hits, state.misses)
    }
}

impl CartCache for InMemoryCartCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut state = self.state.write().unwrap();
        if state.unavailable {
            return Err(CacheError::Unavailable("injected outage".to_string()));
        }
        let value = state.entries.get(key).map(|(value, _)| value.clone());
        if value.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut state = self.state.write().unwrap();
        if state.unavailable {
            return Err(CacheError::Unavailable("injected outage".to_string()));
        }
        if state.fail_writes {
            return Err(CacheError::Operation("injected write failure".to_string()));
        }
        state
            .entries
            .insert(key.to_string(), (value.to_string(), ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut state = self.state.write().unwrap();
        if state.unavailable {
            return Err(CacheError::Unavailable("injected outage".to_string()));
        }
        if state.fail_writes {
            return Err(CacheError::Operation("injected write failure".to_string()));
        }
        state.entries.remove(key);
        Ok(())
    }
}
