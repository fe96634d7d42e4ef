//! Relational store abstractions.
//!
//! Two independent stores take part in the pipeline:
//!
//! - [`CartStore`]: the source of truth for carts. Writes are versioned; a save
//!   only succeeds against the version it was loaded at.
//! - [`OrderStore`]: written by the checkout consumer. Creation is idempotent per
//!   [`IdempotencyKey`](crate::order::IdempotencyKey).
//!
//! # Versioning
//!
//! A [`Cart`] with version `0` has never been stored. `save` of a version-0 cart is
//! an insert; `save` of version `n` is an update guarded by `version = n`. Either
//! way the returned cart carries the new stored version. A missing row reads as
//! version `0` in [`StoreError::Conflict`].

use crate::cart::{Cart, UserId};
use crate::order::{NewOrder, Order, OrderCreation, OrderId};
use std::future::Future;
use thiserror::Error;

/// Errors returned by store implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database rejected or failed the operation
    #[error("Database error: {0}")]
    Database(String),

    /// The cart changed since it was loaded
    #[error("Version conflict for cart '{user_id}': expected {expected}, found {actual}")]
    Conflict {
        /// Cart owner
        user_id: String,
        /// Version the caller loaded
        expected: i64,
        /// Version currently stored (0 if the cart no longer exists)
        actual: i64,
    },

    /// Stored data could not be mapped to domain types
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether this is an optimistic concurrency conflict
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Durable cart storage keyed by user.
pub trait CartStore: Send + Sync {
    /// Loads a cart with its items.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn load(&self, user_id: &UserId)
    -> impl Future<Output = Result<Option<Cart>, StoreError>> + Send;

    /// Loads a cart, creating an empty stored cart if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read or the insert fails.
    fn load_or_create(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Cart, StoreError>> + Send;

    /// Persists the cart's items, guarded by its version.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the stored version differs from `cart.version()`
    /// - [`StoreError::Database`] on any other failure
    fn save(&self, cart: &Cart) -> impl Future<Output = Result<Cart, StoreError>> + Send;

    /// Deletes a cart and its items, guarded by its version. Returns `false` if no
    /// cart is stored.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the stored version differs from `cart.version()`
    /// - [`StoreError::Database`] on any other failure
    fn delete(&self, cart: &Cart) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Durable order storage.
pub trait OrderStore: Send + Sync {
    /// Creates an order unless one already exists for the same idempotency key.
    ///
    /// Implementations must make check-and-insert atomic: two concurrent calls with
    /// the same key produce exactly one [`OrderCreation::Created`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails. Nothing is written in that case.
    fn create_order(
        &self,
        order: NewOrder,
    ) -> impl Future<Output = Result<OrderCreation, StoreError>> + Send;

    /// Fetches a single order with its items.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn get_order(&self, id: OrderId)
    -> impl Future<Output = Result<Option<Order>, StoreError>> + Send;

    /// All orders of a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn orders_for_user(
        &self,
        user_id: &UserId,
    ) -> impl Future<Output = Result<Vec<Order>, StoreError>> + Send;
}
