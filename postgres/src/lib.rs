//! `PostgreSQL` stores for the cart checkout pipeline.
//!
//! - [`PostgresCartStore`]: carts and cart items, versioned for optimistic
//!   concurrency
//! - [`PostgresOrderStore`]: orders and order items with idempotent creation
//! - [`DeadLetterQueue`]: ledger of checkout messages that could not be persisted
//!
//! The cart and order databases are independent. Each store runs its own
//! migration set via `migrate()`; the dead-letter ledger lives in the order
//! database and is created by [`PostgresOrderStore::migrate`].
//!
//! # Example
//!
//! ```no_run
//! use cartflow_postgres::{DeadLetterQueue, PostgresOrderStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = sqlx::PgPool::connect("postgres://localhost/orders").await?;
//! let orders = PostgresOrderStore::new(pool.clone());
//! orders.migrate().await?;
//! let dead_letters = DeadLetterQueue::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cart_store;
mod dead_letter_queue;
mod order_store;

pub use cart_store::PostgresCartStore;
pub use dead_letter_queue::{DLQStatus, DeadLetterEntry, DeadLetterQueue};
pub use order_store::{DEFAULT_DEDUP_WINDOW_MINUTES, PostgresOrderStore};

use cartflow_core::StoreError;

#[allow(clippy::needless_pass_by_value)] // Used as `map_err(db_error)`
fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_db_quantity(quantity: u32) -> Result<i32, StoreError> {
    i32::try_from(quantity)
        .map_err(|_| StoreError::Serialization(format!("Quantity {quantity} exceeds INT range")))
}

fn to_domain_quantity(quantity: i32) -> Result<u32, StoreError> {
    u32::try_from(quantity)
        .map_err(|_| StoreError::Serialization(format!("Negative stored quantity {quantity}")))
}
