//! # Cartflow Core
//!
//! Domain types and infrastructure traits for the cart checkout pipeline.
//!
//! The pipeline spans three independently failing systems with no transaction
//! across them:
//!
//! ```text
//!            ┌──────────────┐   1. write    ┌──────────────┐
//!  caller ──▶│ CartService  │──────────────▶│  CartStore   │◄── source of truth
//!            │              │   2. refresh  ├──────────────┤
//!            │              │──────────────▶│  CartCache   │◄── disposable
//!            └──────┬───────┘               └──────────────┘
//!                   │ checkout: publish, then delete
//!                   ▼
//!            ┌──────────────┐  at-least-once  ┌──────────────────┐   ┌────────────┐
//!            │ MessageBroker│────────────────▶│ CheckoutConsumer │──▶│ OrderStore │
//!            └──────────────┘                 └──────────────────┘   └────────────┘
//! ```
//!
//! Consistency comes from operation ordering and idempotent order creation, not
//! from locking:
//!
//! - every write goes to the store first and the cache second; cache failures are
//!   absorbed,
//! - checkout publishes before it deletes,
//! - the consumer deduplicates redeliveries by checkout token or content fingerprint.
//!
//! This crate holds only types and traits. Backends live in `cartflow-postgres`,
//! `cartflow-redis` and `cartflow-redpanda`; orchestration lives in
//! `cartflow-runtime`; in-memory doubles live in `cartflow-testing`.

pub mod broker;
pub mod cache;
pub mod cart;
pub mod checkout;
pub mod dead_letter;
pub mod order;
pub mod store;

pub use broker::{
    Acknowledger, BrokerError, BrokerFuture, CHECKOUT_QUEUE, Delivery, DeliveryStream,
    MessageBroker, QueueSpec,
};
pub use cache::{CacheError, CartCache};
pub use cart::{AddOutcome, Cart, CartError, CartItem, CartView, LineItem, MAX_QUANTITY, UserId};
pub use checkout::{CheckoutEvent, CheckoutEventError};
pub use dead_letter::{DeadLetterSink, FailedCheckout};
pub use order::{IdempotencyKey, NewOrder, Order, OrderCreation, OrderId};
pub use store::{CartStore, OrderStore, StoreError};

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;

/// Injected dependencies that are not storage.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Orders are stamped with `now()` when the consumer creates them.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
