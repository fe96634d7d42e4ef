//! Cart domain types.
//!
//! A [`Cart`] is the per-user collection of pending line items. It lives in the
//! relational cart store (source of truth) and is mirrored into the cache as a
//! [`CartView`], the externally-visible JSON shape:
//!
//! ```json
//! { "userId": "u1", "items": [{ "productId": "p1", "productName": "Widget", "quantity": 2, "price": 9.99 }] }
//! ```
//!
//! # Invariants
//!
//! - `productId` is unique within a cart; adding the same product again increments
//!   the existing line instead of appending a second one.
//! - Quantities are always strictly positive. An add of zero units is a no-op.
//! - Unit prices are non-negative and carry two fractional digits.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of fractional digits kept for monetary values.
pub const PRICE_SCALE: u32 = 2;

/// Largest quantity a single cart line may hold, the range of a signed 32-bit
/// integer column.
pub const MAX_QUANTITY: u32 = i32::MAX.unsigned_abs();

/// Errors raised by cart mutations that would break a cart invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CartError {
    /// Unit price below zero.
    #[error("Negative unit price {price} for product '{product_id}'")]
    NegativePrice {
        /// Product the price was given for
        product_id: String,
        /// The rejected price
        price: Decimal,
    },

    /// The line quantity would exceed [`MAX_QUANTITY`].
    #[error("Quantity overflow for product '{product_id}'")]
    QuantityOverflow {
        /// Product whose quantity overflowed
        product_id: String,
    },
}

/// Identity of a cart owner. Doubles as the cart's key in store and cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a new `UserId` from a string
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Rounds a monetary amount to [`PRICE_SCALE`] digits.
#[must_use]
pub fn normalize_price(price: Decimal) -> Decimal {
    price.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// A flat `{productId, productName, quantity, price}` tuple.
///
/// This is the shape shared by the cache projection, the checkout event payload
/// and order lines. It holds scalars only, so serializing it never walks back into
/// the owning cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    /// Product identifier (unique within a cart)
    pub product_id: String,
    /// Product name for display
    pub product_name: String,
    /// Number of units
    pub quantity: u32,
    /// Price per unit
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
}

impl LineItem {
    /// Creates a new line item
    #[must_use]
    pub fn new(
        product_id: impl Into<String>,
        product_name: impl Into<String>,
        quantity: u32,
        price: Decimal,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            product_name: product_name.into(),
            quantity,
            price,
        }
    }

    /// `quantity × price`
    #[must_use]
    pub fn line_total(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

/// A single product line owned by a [`Cart`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CartItem {
    product_id: String,
    product_name: String,
    quantity: u32,
    unit_price: Decimal,
}

impl CartItem {
    /// Rebuilds an item from stored columns.
    ///
    /// Returns `None` when the stored quantity is zero, which cannot be a valid
    /// line.
    #[must_use]
    pub fn from_stored(
        product_id: String,
        product_name: String,
        quantity: u32,
        unit_price: Decimal,
    ) -> Option<Self> {
        (quantity > 0).then(|| Self {
            product_id,
            product_name,
            quantity,
            unit_price: normalize_price(unit_price),
        })
    }

    /// Product identifier
    #[must_use]
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    /// Product name
    #[must_use]
    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    /// Number of units, always greater than zero
    #[must_use]
    pub const fn quantity(&self) -> u32 {
        self.quantity
    }

    /// Price per unit
    #[must_use]
    pub const fn unit_price(&self) -> Decimal {
        self.unit_price
    }

    /// Flat projection of this item
    #[must_use]
    pub fn to_line_item(&self) -> LineItem {
        LineItem::new(
            self.product_id.clone(),
            self.product_name.clone(),
            self.quantity,
            self.unit_price,
        )
    }
}

/// Result of [`Cart::add_item`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new line was appended
    Added,
    /// An existing line's quantity was increased to the given value
    Incremented {
        /// Quantity after the increment
        quantity: u32,
    },
    /// Nothing changed (zero units requested)
    Unchanged,
}

impl AddOutcome {
    /// Whether the cart was modified and needs persisting
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// A user's cart as held by the cart store.
///
/// `version` is an optimistic concurrency token maintained by the store; it never
/// appears in the cache projection or on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cart {
    user_id: UserId,
    items: Vec<CartItem>,
    version: i64,
}

impl Cart {
    /// A fresh empty cart that has not been stored yet
    #[must_use]
    pub const fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            items: Vec::new(),
            version: 0,
        }
    }

    /// Rebuilds a cart from stored state
    #[must_use]
    pub const fn from_parts(user_id: UserId, items: Vec<CartItem>, version: i64) -> Self {
        Self {
            user_id,
            items,
            version,
        }
    }

    /// Owner of the cart
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Items currently in the cart
    #[must_use]
    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    /// Version the cart was loaded at
    #[must_use]
    pub const fn version(&self) -> i64 {
        self.version
    }

    /// Returns a copy carrying a new version (used by stores after a write)
    #[must_use]
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Whether the cart holds no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Looks up an item by product
    #[must_use]
    pub fn item(&self, product_id: &str) -> Option<&CartItem> {
        self.items.iter().find(|item| item.product_id == product_id)
    }

    /// Adds `quantity` units of a product.
    ///
    /// If the product is already in the cart its quantity is incremented and the
    /// stored name and price are kept; otherwise a new line is appended.
    ///
    /// # Errors
    ///
    /// - [`CartError::NegativePrice`] if `unit_price` is below zero
    /// - [`CartError::QuantityOverflow`] if the line would hold more than
    ///   [`MAX_QUANTITY`] units
    pub fn add_item(
        &mut self,
        product_id: &str,
        product_name: &str,
        quantity: u32,
        unit_price: Decimal,
    ) -> Result<AddOutcome, CartError> {
        if unit_price.is_sign_negative() && !unit_price.is_zero() {
            return Err(CartError::NegativePrice {
                product_id: product_id.to_string(),
                price: unit_price,
            });
        }

        if quantity == 0 {
            return Ok(AddOutcome::Unchanged);
        }

        let overflow = || CartError::QuantityOverflow {
            product_id: product_id.to_string(),
        };

        if let Some(existing) = self
            .items
            .iter_mut()
            .find(|item| item.product_id == product_id)
        {
            existing.quantity = existing
                .quantity
                .checked_add(quantity)
                .filter(|total| *total <= MAX_QUANTITY)
                .ok_or_else(overflow)?;
            return Ok(AddOutcome::Incremented {
                quantity: existing.quantity,
            });
        }

        if quantity > MAX_QUANTITY {
            return Err(overflow());
        }

        self.items.push(CartItem {
            product_id: product_id.to_string(),
            product_name: product_name.to_string(),
            quantity,
            unit_price: normalize_price(unit_price),
        });
        Ok(AddOutcome::Added)
    }

    /// Removes the line for `product_id`, returning it if it was present.
    pub fn remove_item(&mut self, product_id: &str) -> Option<CartItem> {
        let index = self
            .items
            .iter()
            .position(|item| item.product_id == product_id)?;
        Some(self.items.remove(index))
    }

    /// Takes the units of `items` out of the cart, dropping lines that reach zero.
    ///
    /// A product that is missing or holds fewer units is taken down as far as it
    /// goes.
    pub fn subtract(&mut self, items: &[LineItem]) {
        for line in items {
            let Some(index) = self
                .items
                .iter()
                .position(|item| item.product_id == line.product_id)
            else {
                continue;
            };
            let remaining = self.items[index].quantity.saturating_sub(line.quantity);
            if remaining == 0 {
                self.items.remove(index);
            } else {
                self.items[index].quantity = remaining;
            }
        }
    }

    /// `Σ quantity × unit_price`
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.items
            .iter()
            .map(|item| item.unit_price * Decimal::from(item.quantity))
            .sum()
    }

    /// The externally-visible projection cached and returned to callers
    #[must_use]
    pub fn view(&self) -> CartView {
        CartView {
            user_id: self.user_id.clone(),
            items: self.items.iter().map(CartItem::to_line_item).collect(),
        }
    }
}

/// Externally-visible cart shape. This is exactly what the cache stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    /// Owner of the cart
    pub user_id: UserId,
    /// Cart lines
    #[serde(default)]
    pub items: Vec<LineItem>,
}

impl CartView {
    /// An empty view for `user_id`
    #[must_use]
    pub const fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            items: Vec::new(),
        }
    }

    /// Derived total, `Σ quantity × price`
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.items.iter().map(LineItem::line_total).sum()
    }

    /// Looks up a line by product
    #[must_use]
    pub fn item(&self, product_id: &str) -> Option<&LineItem> {
        self.items.iter().find(|item| item.product_id == product_id)
    }

    /// Encodes the view as the cache value.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if encoding fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a cache value.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error for malformed input.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn adding_same_product_increments_quantity() {
        let mut cart = Cart::new(UserId::new("u1"));

        assert_eq!(
            cart.add_item("p1", "Widget", 2, dec("9.99")).unwrap(),
            AddOutcome::Added
        );
        assert_eq!(
            cart.add_item("p1", "Widget", 3, dec("9.99")).unwrap(),
            AddOutcome::Incremented { quantity: 5 }
        );

        assert_eq!(cart.items().len(), 1);
        assert_eq!(cart.item("p1").unwrap().quantity(), 5);
        assert_eq!(cart.total(), dec("49.95"));
    }

    #[test]
    fn zero_quantity_add_is_a_no_op() {
        let mut cart = Cart::new(UserId::new("u1"));

        assert_eq!(
            cart.add_item("p1", "Widget", 0, dec("1.00")).unwrap(),
            AddOutcome::Unchanged
        );
        assert!(cart.is_empty());
    }

    #[test]
    fn negative_price_is_rejected() {
        let mut cart = Cart::new(UserId::new("u1"));

        let err = cart.add_item("p1", "Widget", 1, dec("-0.01")).unwrap_err();
        assert!(matches!(err, CartError::NegativePrice { .. }));
        assert!(cart.is_empty());
    }

    #[test]
    fn quantity_overflow_is_rejected() {
        let mut cart = Cart::new(UserId::new("u1"));
        cart.add_item("p1", "Widget", MAX_QUANTITY, dec("1")).unwrap();

        let err = cart.add_item("p1", "Widget", 1, dec("1")).unwrap_err();
        assert_eq!(
            err,
            CartError::QuantityOverflow {
                product_id: "p1".to_string()
            }
        );
        assert_eq!(cart.item("p1").unwrap().quantity(), MAX_QUANTITY);
    }

    #[test]
    fn new_line_above_max_quantity_is_rejected() {
        let mut cart = Cart::new(UserId::new("u1"));

        let err = cart
            .add_item("p1", "Widget", MAX_QUANTITY + 1, dec("1"))
            .unwrap_err();
        assert!(matches!(err, CartError::QuantityOverflow { .. }));
        assert!(cart.is_empty());

        let err = cart.add_item("p2", "Gadget", u32::MAX, dec("1")).unwrap_err();
        assert!(matches!(err, CartError::QuantityOverflow { .. }));
        assert!(cart.is_empty());
    }

    #[test]
    fn subtract_keeps_units_added_later() {
        let mut cart = Cart::new(UserId::new("u1"));
        cart.add_item("p1", "Widget", 5, dec("9.99")).unwrap();
        cart.add_item("p2", "Gadget", 1, dec("2.00")).unwrap();
        cart.add_item("p3", "Gizmo", 4, dec("1.00")).unwrap();

        cart.subtract(&[
            LineItem::new("p1", "Widget", 3, dec("9.99")),
            LineItem::new("p2", "Gadget", 2, dec("2.00")),
            LineItem::new("p9", "Missing", 1, dec("1.00")),
        ]);

        assert_eq!(cart.item("p1").unwrap().quantity(), 2);
        assert!(cart.item("p2").is_none());
        assert_eq!(cart.item("p3").unwrap().quantity(), 4);
        assert_eq!(cart.items().len(), 2);
    }

    #[test]
    fn remove_missing_item_returns_none() {
        let mut cart = Cart::new(UserId::new("u1"));
        cart.add_item("p1", "Widget", 1, dec("2.50")).unwrap();

        assert!(cart.remove_item("p2").is_none());
        assert!(cart.remove_item("p1").is_some());
        assert!(cart.is_empty());
    }

    #[test]
    fn prices_are_normalized_to_two_digits() {
        let mut cart = Cart::new(UserId::new("u1"));
        cart.add_item("p1", "Widget", 1, dec("1.005")).unwrap();

        assert_eq!(cart.item("p1").unwrap().unit_price(), dec("1.01"));
    }

    #[test]
    fn view_serializes_to_flat_camel_case_json() {
        let mut cart = Cart::new(UserId::new("u1"));
        cart.add_item("p1", "Widget", 2, dec("9.99")).unwrap();

        let json: serde_json::Value = serde_json::from_str(&cart.view().to_json().unwrap()).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "userId": "u1",
                "items": [{ "productId": "p1", "productName": "Widget", "quantity": 2, "price": 9.99 }]
            })
        );
    }

    #[test]
    fn malformed_view_json_is_an_error() {
        assert!(CartView::from_json("{\"userId\": 42").is_err());
        assert!(CartView::from_json("not json").is_err());
    }

    #[test]
    fn stored_zero_quantity_is_not_an_item() {
        assert!(CartItem::from_stored("p1".into(), "Widget".into(), 0, dec("1")).is_none());
    }
}
