//! Configuration for the cart service and the checkout consumer.

use crate::retry::RetryPolicy;
use cartflow_core::QueueSpec;
use std::time::Duration;

/// Default absolute expiry of a cache entry.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default number of delivery attempts before a checkout is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Cart service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CartServiceConfig {
    /// Expiry set on every cache write (absolute, never extended by reads)
    pub cache_ttl: Duration,
    /// Retries of the load-modify-save cycle on version conflicts
    pub write_retry: RetryPolicy,
}

impl CartServiceConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set cache TTL
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set conflict retry policy
    #[must_use]
    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }
}

impl Default for CartServiceConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            write_retry: RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(Duration::from_millis(5))
                .max_delay(Duration::from_millis(200))
                .build(),
        }
    }
}

/// Checkout consumer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Queue to consume, declared identically to the publisher's
    pub queue: QueueSpec,
    /// Redelivery bound and spacing; `max_attempts()` deliveries before dead-lettering
    pub redelivery: RetryPolicy,
}

impl ConsumerConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue
    #[must_use]
    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queue = queue;
        self
    }

    /// Set the redelivery policy
    #[must_use]
    pub fn with_redelivery(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    /// Set the number of delivery attempts, keeping the backoff
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.redelivery.max_retries = attempts.saturating_sub(1);
        self
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: QueueSpec::checkout(),
            redelivery: RetryPolicy::builder()
                .max_retries(DEFAULT_MAX_ATTEMPTS - 1)
                .initial_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(5))
                .build(),
        }
    }
}
