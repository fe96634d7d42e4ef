//! Prometheus metrics for the checkout pipeline.
//!
//! Counters recorded by the cart service, the publisher and the consumer:
//!
//! | Metric | Recorded when |
//! |--------|---------------|
//! | `cart_cache_hits_total` | `get_cart` served from cache |
//! | `cart_cache_misses_total` | `get_cart` fell back to the store (miss or corrupt entry) |
//! | `cart_cache_errors_total` | any cache call failed and was absorbed |
//! | `checkout_events_published_total` | a checkout event was confirmed by the broker |
//! | `checkout_publish_failures_total` | publishing failed and the checkout was aborted |
//! | `orders_created_total` | the consumer wrote a new order |
//! | `orders_duplicate_deliveries_total` | a redelivered event matched an existing order |
//! | `checkout_messages_malformed_total` | a message was dropped as malformed |
//! | `checkout_messages_requeued_total` | a message was nacked for redelivery |
//! | `checkout_messages_dead_lettered_total` | a message exhausted its attempts |
//!
//! # Example
//!
//! ```rust,no_run
//! use cartflow_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start_http()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::counter;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Installs the Prometheus recorder without an HTTP listener.
    ///
    /// Metrics can then be read with [`render`](Self::render).
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a different recorder is already
    /// installed. A second Prometheus recorder is tolerated with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Installs the recorder and serves `/metrics` on the configured address.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the listener cannot be set up or a
    /// recorder is already installed.
    pub fn start_http(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        tracing::info!(addr = %self.addr, "Metrics server started");
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if [`start`](Self::start) has not installed a recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!("cart_cache_hits_total", "Cart reads served from the cache");
    describe_counter!(
        "cart_cache_misses_total",
        "Cart reads that fell back to the store"
    );
    describe_counter!(
        "cart_cache_errors_total",
        "Cache operations that failed and were absorbed"
    );
    describe_counter!(
        "checkout_events_published_total",
        "Checkout events confirmed by the broker"
    );
    describe_counter!(
        "checkout_publish_failures_total",
        "Checkouts aborted because publishing failed"
    );
    describe_counter!("orders_created_total", "Orders created by the consumer");
    describe_counter!(
        "orders_duplicate_deliveries_total",
        "Deliveries that matched an existing order"
    );
    describe_counter!(
        "checkout_messages_malformed_total",
        "Checkout messages dropped as malformed"
    );
    describe_counter!(
        "checkout_messages_requeued_total",
        "Checkout messages nacked for redelivery"
    );
    describe_counter!(
        "checkout_messages_dead_lettered_total",
        "Checkout messages moved to the dead-letter ledger"
    );
}

/// Cart service metrics recorder.
pub struct CartMetrics;

impl CartMetrics {
    /// Record a cache hit.
    pub fn record_cache_hit() {
        counter!("cart_cache_hits_total").increment(1);
    }

    /// Record a cache miss.
    pub fn record_cache_miss() {
        counter!("cart_cache_misses_total").increment(1);
    }

    /// Record an absorbed cache failure.
    pub fn record_cache_error(operation: &'static str) {
        counter!("cart_cache_errors_total", "operation" => operation).increment(1);
    }
}

/// Checkout publish/consume metrics recorder.
pub struct CheckoutMetrics;

impl CheckoutMetrics {
    /// Record a confirmed publish.
    pub fn record_published() {
        counter!("checkout_events_published_total").increment(1);
    }

    /// Record a failed publish.
    pub fn record_publish_failure() {
        counter!("checkout_publish_failures_total").increment(1);
    }

    /// Record a new order.
    pub fn record_order_created() {
        counter!("orders_created_total").increment(1);
    }

    /// Record a duplicate delivery.
    pub fn record_duplicate() {
        counter!("orders_duplicate_deliveries_total").increment(1);
    }

    /// Record a malformed message.
    pub fn record_malformed() {
        counter!("checkout_messages_malformed_total").increment(1);
    }

    /// Record a requeued message.
    pub fn record_requeued() {
        counter!("checkout_messages_requeued_total").increment(1);
    }

    /// Record a dead-lettered message.
    pub fn record_dead_lettered() {
        counter!("checkout_messages_dead_lettered_total").increment(1);
    }
}
