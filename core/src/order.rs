//! Orders created by the checkout consumer.
//!
//! An [`Order`] is a copy of a [`CheckoutEvent`]'s items plus identity and a
//! creation timestamp assigned by the consumer. The order total is always derived
//! from the items and never stored.

use crate::cart::{LineItem, UserId};
use crate::checkout::CheckoutEvent;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Store-assigned order identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(i64);

impl OrderId {
    /// Wraps a raw identifier
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw identifier value
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Identifier assigned by the order store
    pub id: OrderId,
    /// Buyer
    pub user_id: UserId,
    /// When the consumer created the order
    pub created_at: DateTime<Utc>,
    /// Checkout token the order was created from, if the event carried one
    pub checkout_id: Option<Uuid>,
    /// Content fingerprint of the originating event
    pub fingerprint: String,
    /// Ordered products
    pub items: Vec<LineItem>,
}

impl Order {
    /// `Σ quantity × price` over the current items
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.items.iter().map(LineItem::line_total).sum()
    }
}

/// Key used to decide whether an order already exists for an event.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdempotencyKey {
    /// Producer-assigned checkout token; unique for all time
    Checkout(Uuid),
    /// Content fingerprint; unique only within the store's dedup window
    Fingerprint(String),
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checkout(id) => write!(f, "checkout:{id}"),
            Self::Fingerprint(hash) => write!(f, "fingerprint:{hash}"),
        }
    }
}

/// An order that has not been persisted yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOrder {
    /// Buyer
    pub user_id: UserId,
    /// Creation timestamp, taken from the consumer's clock
    pub created_at: DateTime<Utc>,
    /// Checkout token from the event
    pub checkout_id: Option<Uuid>,
    /// Content fingerprint of the event
    pub fingerprint: String,
    /// Items copied from the event
    pub items: Vec<LineItem>,
}

impl NewOrder {
    /// Copies an event into an order stamped with `created_at`.
    #[must_use]
    pub fn from_event(event: &CheckoutEvent, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id: event.user_id().clone(),
            created_at,
            checkout_id: event.checkout_id(),
            fingerprint: event.fingerprint(),
            items: event.items().to_vec(),
        }
    }

    /// The key the order store deduplicates on
    #[must_use]
    pub fn idempotency_key(&self) -> IdempotencyKey {
        self.checkout_id.map_or_else(
            || IdempotencyKey::Fingerprint(self.fingerprint.clone()),
            IdempotencyKey::Checkout,
        )
    }

    /// Attaches the store-assigned id
    #[must_use]
    pub fn into_order(self, id: OrderId) -> Order {
        Order {
            id,
            user_id: self.user_id,
            created_at: self.created_at,
            checkout_id: self.checkout_id,
            fingerprint: self.fingerprint,
            items: self.items,
        }
    }
}

/// Result of [`OrderStore::create_order`](crate::store::OrderStore::create_order).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderCreation {
    /// A new order was written
    Created(Order),
    /// An equivalent order already existed; nothing was written
    Duplicate(OrderId),
}
