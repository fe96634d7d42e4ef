//! The checkout event handed from the cart domain to the order domain.
//!
//! # Wire Format
//!
//! UTF-8 JSON, flat and cycle-free:
//!
//! ```json
//! {
//!   "userId": "u1",
//!   "checkoutId": "6f1c…",
//!   "items": [{ "productId": "p1", "productName": "Widget", "quantity": 5, "price": 9.99 }]
//! }
//! ```
//!
//! `checkoutId` is optional on input. Producers in this workspace always set it so
//! that consumers can deduplicate redeliveries; messages without it fall back to
//! the content [`fingerprint`](CheckoutEvent::fingerprint).

use crate::cart::{Cart, CartItem, LineItem, MAX_QUANTITY, UserId, normalize_price};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Why a payload could not be accepted as a [`CheckoutEvent`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckoutEventError {
    /// Not valid JSON for the event shape
    #[error("Malformed checkout payload: {0}")]
    Malformed(String),

    /// The event carries no items
    #[error("Checkout event for user '{0}' has no items")]
    Empty(String),

    /// An item has a zero quantity or negative price
    #[error("Invalid item '{product_id}' in checkout event: {reason}")]
    InvalidItem {
        /// Offending product
        product_id: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Immutable snapshot of a cart at checkout time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutEvent {
    user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checkout_id: Option<Uuid>,
    items: Vec<LineItem>,
}

impl CheckoutEvent {
    /// Builds the event from the current cart contents.
    #[must_use]
    pub fn from_cart(cart: &Cart, checkout_id: Uuid) -> Self {
        Self {
            user_id: cart.user_id().clone(),
            checkout_id: Some(checkout_id),
            items: cart.items().iter().map(CartItem::to_line_item).collect(),
        }
    }

    /// Builds an event directly from its parts
    #[must_use]
    pub const fn new(user_id: UserId, checkout_id: Option<Uuid>, items: Vec<LineItem>) -> Self {
        Self {
            user_id,
            checkout_id,
            items,
        }
    }

    /// User who checked out
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Idempotency token assigned at checkout, if the producer sent one
    #[must_use]
    pub const fn checkout_id(&self) -> Option<Uuid> {
        self.checkout_id
    }

    /// Items in the snapshot
    #[must_use]
    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    /// Encodes the event as the queue message body.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if encoding fails.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes and validates a queue message body.
    ///
    /// # Errors
    ///
    /// - [`CheckoutEventError::Malformed`] if the bytes are not the event shape
    /// - [`CheckoutEventError::Empty`] if there are no items
    /// - [`CheckoutEventError::InvalidItem`] for zero or out-of-range quantities
    ///   and negative prices
    pub fn from_payload(payload: &[u8]) -> Result<Self, CheckoutEventError> {
        let mut event: Self = serde_json::from_slice(payload)
            .map_err(|e| CheckoutEventError::Malformed(e.to_string()))?;

        if event.items.is_empty() {
            return Err(CheckoutEventError::Empty(event.user_id.to_string()));
        }

        for item in &mut event.items {
            if item.quantity == 0 {
                return Err(CheckoutEventError::InvalidItem {
                    product_id: item.product_id.clone(),
                    reason: "quantity must be positive".to_string(),
                });
            }
            if item.quantity > MAX_QUANTITY {
                return Err(CheckoutEventError::InvalidItem {
                    product_id: item.product_id.clone(),
                    reason: format!("quantity {} exceeds {MAX_QUANTITY}", item.quantity),
                });
            }
            if item.price.is_sign_negative() && !item.price.is_zero() {
                return Err(CheckoutEventError::InvalidItem {
                    product_id: item.product_id.clone(),
                    reason: format!("negative price {}", item.price),
                });
            }
            item.price = normalize_price(item.price);
        }

        Ok(event)
    }

    /// SHA-256 over the user and the order-independent item set, hex encoded.
    ///
    /// Two events describing the same user buying the same items produce the same
    /// fingerprint regardless of item order or `checkoutId`.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut lines: Vec<String> = self
            .items
            .iter()
            .map(|item| {
                format!(
                    "{}\u{1f}{}\u{1f}{}\u{1f}{}",
                    item.product_id,
                    item.product_name,
                    item.quantity,
                    normalize_price(item.price)
                )
            })
            .collect();
        lines.sort();

        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_str().as_bytes());
        for line in &lines {
            hasher.update(b"\x1e");
            hasher.update(line.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}
