//! In-memory cart and order stores.
//!
//! Both stores are cheap to clone (clones share state) and expose inspection and
//! failure-injection helpers so tests can drive every error path of the service
//! and the consumer.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use cartflow_core::{
    Cart, CartStore, IdempotencyKey, NewOrder, Order, OrderCreation, OrderId, OrderStore,
    StoreError, UserId,
};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct CartState {
    carts: HashMap<UserId, Cart>,
    fail_reads: bool,
    fail_writes: bool,
    pending_conflicts: u32,
    write_before_delete: Option<Cart>,
    saves: u64,
    deletes: u64,
}

/// HashMap-backed [`CartStore`] with versioned saves.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCartStore {
    state: Arc<RwLock<CartState>>,
}

impl InMemoryCartStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stored cart for `user_id`, bypassing failure injection
    #[must_use]
    pub fn stored(&self, user_id: &str) -> Option<Cart> {
        self.state.read().unwrap().carts.get(&UserId::new(user_id)).cloned()
    }

    /// Number of stored carts
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().carts.len()
    }

    /// Whether no carts are stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every read fail with [`StoreError::Database`]
    pub fn fail_reads(&self, fail: bool) {
        self.state.write().unwrap().fail_reads = fail;
    }

    /// Make every write (save, create, delete) fail with [`StoreError::Database`]
    pub fn fail_writes(&self, fail: bool) {
        self.state.write().unwrap().fail_writes = fail;
    }

    /// The next `count` saves lose a race against a simulated concurrent writer:
    /// the stored version is bumped and the save returns [`StoreError::Conflict`].
    pub fn inject_conflicts(&self, count: u32) {
        self.state.write().unwrap().pending_conflicts = count;
    }

    /// The next delete first sees `cart` written by a simulated concurrent
    /// writer, at the next stored version.
    pub fn write_before_next_delete(&self, cart: Cart) {
        self.state.write().unwrap().write_before_delete = Some(cart);
    }

    /// Number of successful saves
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.state.read().unwrap().saves
    }

    /// Number of successful deletes
    #[must_use]
    pub fn delete_count(&self) -> u64 {
        self.state.read().unwrap().deletes
    }
}

impl CartStore for InMemoryCartStore {
    async fn load(&self, user_id: &UserId) -> Result<Option<Cart>, StoreError> {
        let state = self.state.read().unwrap();
        if state.fail_reads {
            return Err(StoreError::Database("injected read failure".to_string()));
        }
        Ok(state.carts.get(user_id).cloned())
    }

    async fn load_or_create(&self, user_id: &UserId) -> Result<Cart, StoreError> {
        let mut state = self.state.write().unwrap();
        if state.fail_reads {
            return Err(StoreError::Database("injected read failure".to_string()));
        }
        if let Some(cart) = state.carts.get(user_id) {
            return Ok(cart.clone());
        }
        if state.fail_writes {
            return Err(StoreError::Database("injected write failure".to_string()));
        }
        let cart = Cart::new(user_id.clone()).with_version(1);
        state.carts.insert(user_id.clone(), cart.clone());
        Ok(cart)
    }

    async fn save(&self, cart: &Cart) -> Result<Cart, StoreError> {
        let mut state = self.state.write().unwrap();
        if state.fail_writes {
            return Err(StoreError::Database("injected write failure".to_string()));
        }

        let stored_version = state.carts.get(cart.user_id()).map_or(0, Cart::version);

        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            if let Some(stored) = state.carts.get_mut(cart.user_id()) {
                *stored = stored.clone().with_version(stored_version + 1);
            }
            return Err(StoreError::Conflict {
                user_id: cart.user_id().to_string(),
                expected: cart.version(),
                actual: stored_version + 1,
            });
        }

        if stored_version != cart.version() {
            return Err(StoreError::Conflict {
                user_id: cart.user_id().to_string(),
                expected: cart.version(),
                actual: stored_version,
            });
        }

        let saved = cart.clone().with_version(stored_version + 1);
        state.carts.insert(cart.user_id().clone(), saved.clone());
        state.saves += 1;
        Ok(saved)
    }

    async fn delete(&self, cart: &Cart) -> Result<bool, StoreError> {
        let mut state = self.state.write().unwrap();
        if state.fail_writes {
            return Err(StoreError::Database("injected write failure".to_string()));
        }
        if let Some(concurrent) = state.write_before_delete.take() {
            let version = state.carts.get(concurrent.user_id()).map_or(0, Cart::version) + 1;
            state
                .carts
                .insert(concurrent.user_id().clone(), concurrent.with_version(version));
        }

        let stored_version = match state.carts.get(cart.user_id()) {
            None => return Ok(false),
            Some(stored) => stored.version(),
        };
        if stored_version != cart.version() {
            return Err(StoreError::Conflict {
                user_id: cart.user_id().to_string(),
                expected: cart.version(),
                actual: stored_version,
            });
        }
        state.carts.remove(cart.user_id());
        state.deletes += 1;
        Ok(true)
    }
}

#[derive(Debug)]
struct OrderState {
    orders: Vec<Order>,
    next_id: i64,
    failing_writes: u32,
    fail_all_writes: bool,
    dedup_window: Duration,
}

/// Vec-backed [`OrderStore`] with the same dedup rules as the Postgres store.
#[derive(Clone, Debug)]
pub struct InMemoryOrderStore {
    state: Arc<RwLock<OrderState>>,
}

impl InMemoryOrderStore {
    /// Create a new empty store with a 10 minute fingerprint window
    #[must_use]
    pub fn new() -> Self {
        Self::with_dedup_window(Duration::minutes(10))
    }

    /// Create a store with a custom fingerprint dedup window
    #[must_use]
    pub fn with_dedup_window(window: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(OrderState {
                orders: Vec::new(),
                next_id: 1,
                failing_writes: 0,
                fail_all_writes: false,
                dedup_window: window,
            })),
        }
    }

    /// All stored orders in creation order
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.state.read().unwrap().orders.clone()
    }

    /// Number of stored orders
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().orders.len()
    }

    /// Whether no orders are stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail the next `count` writes
    pub fn fail_next_writes(&self, count: u32) {
        self.state.write().unwrap().failing_writes = count;
    }

    /// Fail every write until switched off
    pub fn fail_all_writes(&self, fail: bool) {
        self.state.write().unwrap().fail_all_writes = fail;
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderStore for InMemoryOrderStore {
    async fn create_order(&self, order: NewOrder) -> Result<OrderCreation, StoreError> {
        let mut state = self.state.write().unwrap();
        if state.fail_all_writes {
            return Err(StoreError::Database("injected write failure".to_string()));
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StoreError::Database("injected write failure".to_string()));
        }

        let window_start = order.created_at - state.dedup_window;
        let existing = match order.idempotency_key() {
            IdempotencyKey::Checkout(id) => state
                .orders
                .iter()
                .find(|o| o.checkout_id == Some(id)),
            IdempotencyKey::Fingerprint(fingerprint) => state.orders.iter().find(|o| {
                o.user_id == order.user_id
                    && o.fingerprint == fingerprint
                    && o.created_at >= window_start
            }),
        };
        if let Some(existing) = existing {
            return Ok(OrderCreation::Duplicate(existing.id));
        }

        let id = OrderId::new(state.next_id);
        state.next_id += 1;
        let created = order.into_order(id);
        state.orders.push(created.clone());
        Ok(OrderCreation::Created(created))
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self
            .state
            .read()
            .unwrap()
            .orders
            .iter()
            .find(|o| o.id == id)
            .cloned())
    }

    async fn orders_for_user(&self, user_id: &UserId) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .state
            .read()
            .unwrap()
            .orders
            .iter()
            .filter(|o| &o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(orders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartflow_core::{CheckoutEvent, LineItem};
    use chrono::Utc;
    use uuid::Uuid;

    fn new_order(checkout_id: Option<Uuid>, at: chrono::DateTime<Utc>) -> NewOrder {
        let event = CheckoutEvent::new(
            UserId::new("u1"),
            checkout_id,
            vec![LineItem::new("p1", "Widget", 1, "1.00".parse().unwrap())],
        );
        NewOrder::from_event(&event, at)
    }

    #[tokio::test]
    async fn stale_save_is_a_conflict() {
        let store = InMemoryCartStore::new();
        let user = UserId::new("u1");
        let loaded = store.load_or_create(&user).await.unwrap();

        let saved = store.save(&loaded).await.unwrap();
        assert_eq!(saved.version(), 2);

        let err = store.save(&loaded).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                user_id: "u1".to_string(),
                expected: 1,
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn save_after_delete_is_a_conflict() {
        let store = InMemoryCartStore::new();
        let user = UserId::new("u1");
        let loaded = store.load_or_create(&user).await.unwrap();
        assert!(store.delete(&loaded).await.unwrap());

        assert!(store.save(&loaded).await.unwrap_err().is_conflict());
        assert!(!store.delete(&loaded).await.unwrap());
    }

    #[tokio::test]
    async fn stale_delete_is_a_conflict() {
        let store = InMemoryCartStore::new();
        let user = UserId::new("u1");
        let loaded = store.load_or_create(&user).await.unwrap();
        store.save(&loaded).await.unwrap();

        let err = store.delete(&loaded).await.unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(store.stored("u1").unwrap().version(), 2);
        assert_eq!(store.delete_count(), 0);
    }

    #[tokio::test]
    async fn checkout_token_dedups_forever() {
        let store = InMemoryOrderStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let first = store.create_order(new_order(Some(id), now)).await.unwrap();
        assert!(matches!(first, OrderCreation::Created(_)));
        let again = store
            .create_order(new_order(Some(id), now + Duration::days(2)))
            .await
            .unwrap();

        assert_eq!(again, OrderCreation::Duplicate(store.orders()[0].id));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn fingerprint_dedups_only_inside_window() {
        let store = InMemoryOrderStore::with_dedup_window(Duration::minutes(10));
        let now = Utc::now();

        store.create_order(new_order(None, now)).await.unwrap();
        let within = store
            .create_order(new_order(None, now + Duration::minutes(5)))
            .await
            .unwrap();
        let after = store
            .create_order(new_order(None, now + Duration::minutes(30)))
            .await
            .unwrap();

        assert!(matches!(within, OrderCreation::Duplicate(_)));
        assert!(matches!(after, OrderCreation::Created(_)));
        assert_eq!(store.len(), 2);
    }
}
