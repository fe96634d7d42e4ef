//! Retry policies with exponential backoff.
//!
//! Two places in the pipeline retry:
//!
//! - the cart service re-runs a load-modify-save cycle when the store reports an
//!   optimistic concurrency conflict ([`retry_with_predicate`]),
//! - the checkout consumer spaces out redeliveries of a message whose order could
//!   not be persisted and stops after [`RetryPolicy::max_attempts`].
//!
//! Publishing is never retried here; a failed publish fails the checkout.
//!
//! # Example
//!
//! ```rust
//! use cartflow_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(5))
//!     .max_delay(Duration::from_millis(100))
//!     .multiplier(2.0)
//!     .build();
//!
//! let saved = retry_with_predicate(
//!     policy,
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("conflict"),
//! ).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use tokio::time::sleep;

/// How often, and how far apart, an operation is retried.
///
/// Delays grow geometrically from `initial_delay` by `multiplier` and never
/// exceed `max_delay`. Defaults: 3 retries, 100ms, doubling, capped at 30s.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single wait
    pub max_delay: Duration,
    /// Growth factor between consecutive waits
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Starts from the default policy.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Retries `max_retries` times without waiting in between.
    #[must_use]
    pub const fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Total attempts allowed, counting the first one.
    #[must_use]
    pub const fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    /// Wait before retry number `retry` (0-based).
    ///
    /// `initial_delay * multiplier^retry`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        if retry == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = retry.min(i32::MAX as usize) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(millis as u64)
    }
}

/// Builder for [`RetryPolicy`]; unset fields keep their defaults.
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, retries: usize) -> Self {
        self.policy.max_retries = retries;
        self
    }

    /// Wait before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Upper bound on any single wait.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Growth factor between waits.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Finishes the policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Retry an async operation while `is_retryable` accepts its error.
///
/// Non-retryable errors are returned immediately. Once `policy.max_retries`
/// retries have failed the last error is returned.
///
/// # Errors
///
/// Returns the operation's error when it is not retryable or retries run out.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    tracing::warn!(attempt, error = %err, "Giving up after retries");
                    return Err(err);
                }

                let wait = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    wait_ms = wait.as_millis(),
                    error = %err,
                    "Retryable failure"
                );

                if !wait.is_zero() {
                    sleep(wait).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn waits_grow_geometrically() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(5))
            .multiplier(3.0)
            .build();

        let waits: Vec<_> = (0..4).map(|n| policy.delay_for_attempt(n)).collect();
        assert_eq!(
            waits,
            [5, 15, 45, 135].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn waits_are_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(50))
            .multiplier(10.0)
            .max_delay(Duration::from_millis(400))
            .build();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10_000), Duration::from_millis(400));
    }

    #[test]
    fn builder_keeps_unset_defaults() {
        let policy = RetryPolicy::builder().max_retries(7).build();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.initial_delay, RetryPolicy::default().initial_delay);
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(4);
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_until_conflict_clears() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_predicate(
            RetryPolicy::immediate(3),
            || {
                let c = Arc::clone(&counter);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("version conflict".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
            |err: &String| err.contains("conflict"),
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_predicate(
            RetryPolicy::immediate(2),
            || {
                let c = Arc::clone(&counter);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(format!("conflict {n}"))
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result, Err("conflict 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_predicate(
            RetryPolicy::default(),
            || {
                let c = Arc::clone(&counter);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("database down")
                }
            },
            |err: &&str| err.contains("conflict"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
