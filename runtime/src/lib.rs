//! # Cartflow Runtime
//!
//! Orchestration for the cart checkout pipeline.
//!
//! ## Core Components
//!
//! - **[`CartService`]**: cache-aside cart reads and store-first writes; checkout
//!   publishes the cart before deleting it
//! - **[`CheckoutPublisher`]**: declares the checkout queue once and publishes
//!   events over the shared broker connection
//! - **[`CheckoutConsumer`]**: long-lived subscriber that creates orders
//!   idempotently, requeues failed deliveries and dead-letters exhausted ones
//!
//! ## Example
//!
//! ```ignore
//! use cartflow_runtime::{CartService, CheckoutPublisher};
//!
//! let broker: Arc<dyn MessageBroker> = Arc::new(RedpandaBroker::builder().brokers("localhost:9092").build()?);
//! let service = CartService::new(
//!     PostgresCartStore::new(cart_pool),
//!     RedisCartCache::connect(RedisCacheConfig::new("redis://localhost:6379")).await?,
//!     CheckoutPublisher::new(Arc::clone(&broker)),
//! );
//!
//! let user = UserId::new("u1");
//! service.add_item(&user, "p1", "Widget", 2, "9.99".parse()?).await?;
//! service.checkout(&user).await?;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Service and consumer configuration
pub mod config;

pub mod cart_service;
pub mod consumer;
pub mod publisher;

pub use cart_service::{CartService, CartServiceError, CheckoutOutcome, RemoveOutcome};
pub use config::{CartServiceConfig, ConsumerConfig};
pub use consumer::{CheckoutConsumer, ConsumerError, DeliveryOutcome};
pub use publisher::{CheckoutPublisher, PublishError};
pub use retry::RetryPolicy;
