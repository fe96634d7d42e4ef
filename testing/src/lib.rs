//! # Cartflow Testing
//!
//! In-memory implementations of every infrastructure trait in `cartflow-core`,
//! for fast deterministic tests of the cart service and the checkout consumer.
//!
//! This crate provides:
//! - [`InMemoryCartStore`] / [`InMemoryOrderStore`]: versioned and deduplicating stores
//! - [`InMemoryCartCache`]: cache with outage and write-failure injection
//! - [`InMemoryBroker`]: manual-ack queues with requeue and attempt counting
//! - [`InMemoryDeadLetterQueue`]: dead-letter ledger
//! - [`FixedClock`]: deterministic time
//!
//! All doubles are `Clone` and share state between clones, so a test can hand one
//! copy to the component under test and keep another for assertions.
//!
//! ## Example
//!
//! ```ignore
//! use cartflow_testing::{InMemoryCartCache, InMemoryCartStore, InMemoryBroker};
//!
//! #[tokio::test]
//! async fn cache_outage_falls_back_to_store() {
//!     let cache = InMemoryCartCache::new();
//!     cache.set_unavailable(true);
//!     let service = CartService::new(InMemoryCartStore::new(), cache, publisher);
//!
//!     let view = service.get_cart(&UserId::new("u1")).await?;
//!     assert!(view.items.is_empty());
//! }
//! ```

mod broker;
mod cache;
mod dead_letter;
mod stores;

pub use broker::InMemoryBroker;
pub use cache::InMemoryCartCache;
pub use dead_letter::InMemoryDeadLetterQueue;
pub use stores::{InMemoryCartStore, InMemoryOrderStore};

use cartflow_core::environment::Clock;
use chrono::{DateTime, Utc};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use cartflow_testing::mocks::FixedClock;
    /// use cartflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything. Honours
/// `RUST_LOG`, defaulting to `debug`.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, test_clock};
