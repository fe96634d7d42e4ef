//! Cart service: cache-aside reads, store-first writes, publish-before-delete
//! checkout.
//!
//! # Ordering
//!
//! ```text
//! get_cart     cache ──hit──▶ return
//!                │ miss / corrupt / error
//!                ▼
//!              store.load_or_create ─▶ cache.set (failure logged) ─▶ return
//!
//! add_item     store.load_or_create ─▶ modify ─▶ store.save ─▶ cache.set (failure logged)
//! remove_item  store.load ─▶ modify ─▶ store.save ─▶ cache.set (failure logged)
//! checkout     store.load ─▶ publish ─▶ store.delete ─▶ cache.remove (failure logged)
//!                                         │ version conflict
//!                                         ▼
//!                                       store.load ─▶ subtract published items ─▶ store.save / store.delete
//! ```
//!
//! Store and broker failures are returned to the caller. Cache failures never are.
//!
//! # Concurrency
//!
//! No lock is held across a request. Saves are guarded by the cart version and a
//! conflicting save re-runs the whole load-modify-save cycle, up to
//! [`CartServiceConfig::write_retry`] retries. The checkout delete is guarded the
//! same way: if the cart changed after the snapshot was published, only the
//! published units are taken out and the later changes stay in the cart.

use crate::config::CartServiceConfig;
use crate::metrics::CartMetrics;
use crate::publisher::{CheckoutPublisher, PublishError};
use crate::retry::retry_with_predicate;
use cartflow_core::{
    AddOutcome, CacheError, Cart, CartCache, CartError, CartStore, CartView, CheckoutEvent,
    Decimal, LineItem, StoreError, UserId, Uuid,
};
use thiserror::Error;

/// Errors surfaced by cart operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CartServiceError {
    /// The cart store failed (including exhausted version conflicts)
    #[error("Cart store error: {0}")]
    Store(#[from] StoreError),

    /// The checkout event was not handed to the broker; the cart is untouched
    #[error("Checkout not published: {0}")]
    Publish(#[from] PublishError),

    /// The requested change would violate a cart invariant
    #[error("Invalid cart operation: {0}")]
    Invalid(#[from] CartError),
}

impl CartServiceError {
    const fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

/// Result of [`CartService::remove_item`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The item was removed; the cart as stored afterwards
    Removed(CartView),
    /// The user has no cart; nothing changed
    CartNotFound,
    /// The cart does not hold the product; nothing changed
    ItemNotFound,
}

impl RemoveOutcome {
    /// Whether anything was removed
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        matches!(self, Self::Removed(_))
    }
}

/// Result of [`CartService::checkout`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// No cart or an empty cart; nothing was published
    NothingToCheckout,
    /// The event was published and the cart deleted
    CheckedOut {
        /// Idempotency token carried by the published event
        checkout_id: Uuid,
        /// Items in the published snapshot
        items: Vec<LineItem>,
    },
}

/// Orchestrates the cart store, the cart cache and the checkout publisher.
pub struct CartService<S, C> {
    store: S,
    cache: C,
    publisher: CheckoutPublisher,
    config: CartServiceConfig,
}

impl<S, C> CartService<S, C>
where
    S: CartStore,
    C: CartCache,
{
    /// Create a service with the default configuration
    #[must_use]
    pub fn new(store: S, cache: C, publisher: CheckoutPublisher) -> Self {
        Self::with_config(store, cache, publisher, CartServiceConfig::default())
    }

    /// Create a service with a custom configuration
    #[must_use]
    pub const fn with_config(
        store: S,
        cache: C,
        publisher: CheckoutPublisher,
        config: CartServiceConfig,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            config,
        }
    }

    /// Returns the user's cart, from cache when possible.
    ///
    /// A cache miss, an unreadable cache entry and a cache error all fall back to
    /// the store. The store read creates an empty cart if the user has none.
    ///
    /// # Errors
    ///
    /// Returns [`CartServiceError::Store`] if the fallback store read fails.
    pub async fn get_cart(&self, user_id: &UserId) -> Result<CartView, CartServiceError> {
        if let Some(view) = self.cached_view(user_id).await {
            CartMetrics::record_cache_hit();
            tracing::debug!(user_id = %user_id, "Cart served from cache");
            return Ok(view);
        }

        CartMetrics::record_cache_miss();
        let cart = self.store.load_or_create(user_id).await?;
        tracing::debug!(user_id = %user_id, version = cart.version(), "Cart loaded from store");

        let view = cart.view();
        self.refresh_cache(&view).await;
        Ok(view)
    }

    /// Adds units of a product, incrementing the line if the product is present.
    ///
    /// Adding zero units changes nothing.
    ///
    /// # Errors
    ///
    /// - [`CartServiceError::Invalid`] for a negative price or quantity overflow
    /// - [`CartServiceError::Store`] if the write fails or conflicts persist
    pub async fn add_item(
        &self,
        user_id: &UserId,
        product_id: &str,
        product_name: &str,
        quantity: u32,
        unit_price: Decimal,
    ) -> Result<CartView, CartServiceError> {
        let (cart, outcome) = retry_with_predicate(
            self.config.write_retry.clone(),
            || self.try_add(user_id, product_id, product_name, quantity, unit_price),
            CartServiceError::is_conflict,
        )
        .await?;

        let view = cart.view();
        if outcome.is_change() {
            tracing::debug!(
                user_id = %user_id,
                product_id,
                quantity,
                outcome = ?outcome,
                "Item added to cart"
            );
            self.refresh_cache(&view).await;
        }
        Ok(view)
    }

    /// Removes a product from the cart.
    ///
    /// A missing cart or a missing product is reported, not an error, and leaves
    /// store and cache untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CartServiceError::Store`] if the read or write fails.
    pub async fn remove_item(
        &self,
        user_id: &UserId,
        product_id: &str,
    ) -> Result<RemoveOutcome, CartServiceError> {
        let outcome = retry_with_predicate(
            self.config.write_retry.clone(),
            || self.try_remove(user_id, product_id),
            CartServiceError::is_conflict,
        )
        .await?;

        if let RemoveOutcome::Removed(view) = &outcome {
            tracing::debug!(user_id = %user_id, product_id, "Item removed from cart");
            self.refresh_cache(view).await;
        }
        Ok(outcome)
    }

    /// Publishes the cart as a checkout event, then deletes it.
    ///
    /// The cart is only deleted after the broker confirmed the event. If publishing
    /// fails the cart, and its cache entry, are left exactly as they were.
    ///
    /// # Errors
    ///
    /// - [`CartServiceError::Publish`] if the event was not published
    /// - [`CartServiceError::Store`] if the cart could not be read, or could not be
    ///   cleared after a successful publish (the event is already out)
    pub async fn checkout(&self, user_id: &UserId) -> Result<CheckoutOutcome, CartServiceError> {
        let Some(cart) = self.store.load(user_id).await? else {
            tracing::debug!(user_id = %user_id, "Checkout without cart");
            return Ok(CheckoutOutcome::NothingToCheckout);
        };
        if cart.is_empty() {
            tracing::debug!(user_id = %user_id, "Checkout of empty cart");
            return Ok(CheckoutOutcome::NothingToCheckout);
        }

        let checkout_id = Uuid::new_v4();
        let event = CheckoutEvent::from_cart(&cart, checkout_id);
        self.publisher.publish(&event).await?;

        let cleared = match self.store.delete(&cart).await {
            Ok(_) => {
                self.evict_cache(user_id).await;
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                tracing::warn!(
                    user_id = %user_id,
                    checkout_id = %checkout_id,
                    "Cart changed during checkout, keeping later changes"
                );
                self.release_checked_out(user_id, event.items()).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = cleared {
            tracing::error!(
                user_id = %user_id,
                checkout_id = %checkout_id,
                error = %e,
                "Checkout published but cart could not be cleared"
            );
            return Err(e);
        }

        tracing::info!(
            user_id = %user_id,
            checkout_id = %checkout_id,
            total = %cart.total(),
            "Cart checked out"
        );
        Ok(CheckoutOutcome::CheckedOut {
            checkout_id,
            items: event.items().to_vec(),
        })
    }

    async fn try_add(
        &self,
        user_id: &UserId,
        product_id: &str,
        product_name: &str,
        quantity: u32,
        unit_price: Decimal,
    ) -> Result<(Cart, AddOutcome), CartServiceError> {
        let mut cart = self.store.load_or_create(user_id).await?;
        let outcome = cart.add_item(product_id, product_name, quantity, unit_price)?;
        if !outcome.is_change() {
            return Ok((cart, outcome));
        }
        let saved = self.store.save(&cart).await?;
        Ok((saved, outcome))
    }

    /// Takes checked-out units out of a cart that changed after its snapshot.
    async fn release_checked_out(
        &self,
        user_id: &UserId,
        items: &[LineItem],
    ) -> Result<(), CartServiceError> {
        let remaining = retry_with_predicate(
            self.config.write_retry.clone(),
            || self.try_release(user_id, items),
            CartServiceError::is_conflict,
        )
        .await?;

        match remaining {
            Some(view) => self.refresh_cache(&view).await,
            None => self.evict_cache(user_id).await,
        }
        Ok(())
    }

    async fn try_release(
        &self,
        user_id: &UserId,
        items: &[LineItem],
    ) -> Result<Option<CartView>, CartServiceError> {
        let Some(mut cart) = self.store.load(user_id).await? else {
            return Ok(None);
        };
        cart.subtract(items);
        if cart.is_empty() {
            self.store.delete(&cart).await?;
            return Ok(None);
        }
        let saved = self.store.save(&cart).await?;
        Ok(Some(saved.view()))
    }

    async fn try_remove(
        &self,
        user_id: &UserId,
        product_id: &str,
    ) -> Result<RemoveOutcome, CartServiceError> {
        let Some(mut cart) = self.store.load(user_id).await? else {
            return Ok(RemoveOutcome::CartNotFound);
        };
        if cart.remove_item(product_id).is_none() {
            return Ok(RemoveOutcome::ItemNotFound);
        }
        let saved = self.store.save(&cart).await?;
        Ok(RemoveOutcome::Removed(saved.view()))
    }

    async fn cached_view(&self, user_id: &UserId) -> Option<CartView> {
        let json = match self.cache.get(user_id.as_str()).await {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(e) => {
                log_cache_error("get", user_id, &e);
                return None;
            }
        };

        match CartView::from_json(&json) {
            Ok(view) if view.user_id == *user_id => Some(view),
            Ok(view) => {
                tracing::warn!(
                    user_id = %user_id,
                    cached_user_id = %view.user_id,
                    "Cache entry belongs to another user, ignoring"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Unreadable cache entry, treating as miss"
                );
                None
            }
        }
    }

    async fn refresh_cache(&self, view: &CartView) {
        let json = match view.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(user_id = %view.user_id, error = %e, "Failed to encode cart for cache");
                return;
            }
        };
        if let Err(e) = self
            .cache
            .set(view.user_id.as_str(), &json, self.config.cache_ttl)
            .await
        {
            log_cache_error("set", &view.user_id, &e);
        }
    }

    async fn evict_cache(&self, user_id: &UserId) {
        if let Err(e) = self.cache.remove(user_id.as_str()).await {
            log_cache_error("remove", user_id, &e);
        }
    }
}

fn log_cache_error(operation: &'static str, user_id: &UserId, error: &CacheError) {
    CartMetrics::record_cache_error(operation);
    tracing::warn!(
        user_id = %user_id,
        operation,
        error = %error,
        "Cache operation failed, continuing without cache"
    );
}
