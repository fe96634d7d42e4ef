//! Cart service behaviour against in-memory store, cache and broker.

#![allow(clippy::unwrap_used)]

use cartflow_core::{
    CartError, CartView, CheckoutEvent, Decimal, LineItem, MAX_QUANTITY, MessageBroker, QueueSpec,
    StoreError, UserId,
};
use cartflow_runtime::retry::RetryPolicy;
use cartflow_runtime::{
    CartService, CartServiceConfig, CartServiceError, CheckoutOutcome, CheckoutPublisher,
    PublishError, RemoveOutcome,
};
use cartflow_testing::{InMemoryBroker, InMemoryCartCache, InMemoryCartStore};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    service: Arc<CartService<InMemoryCartStore, InMemoryCartCache>>,
    store: InMemoryCartStore,
    cache: InMemoryCartCache,
    broker: InMemoryBroker,
}

fn harness_with(config: CartServiceConfig) -> Harness {
    let store = InMemoryCartStore::new();
    let cache = InMemoryCartCache::new();
    let broker = InMemoryBroker::new();
    let publisher = CheckoutPublisher::new(Arc::new(broker.clone()));
    let service = CartService::with_config(store.clone(), cache.clone(), publisher, config);
    Harness {
        service: Arc::new(service),
        store,
        cache,
        broker,
    }
}

fn harness() -> Harness {
    harness_with(CartServiceConfig::default().with_write_retry(RetryPolicy::immediate(5)))
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn u1() -> UserId {
    UserId::new("u1")
}

impl Harness {
    fn cached_view(&self, user: &str) -> Option<CartView> {
        self.cache.raw(user).map(|json| CartView::from_json(&json).unwrap())
    }

    fn published_events(&self) -> Vec<CheckoutEvent> {
        self.broker
            .published("cart.checkout")
            .iter()
            .map(|payload| CheckoutEvent::from_payload(payload).unwrap())
            .collect()
    }
}

#[tokio::test]
async fn widget_scenario_end_to_end() {
    let h = harness();

    h.service.add_item(&u1(), "p1", "Widget", 2, dec("9.99")).await.unwrap();
    let view = h.service.get_cart(&u1()).await.unwrap();
    assert_eq!(
        view.items,
        vec![LineItem::new("p1", "Widget", 2, dec("9.99"))]
    );
    assert_eq!(view.total(), dec("19.98"));

    h.service.add_item(&u1(), "p1", "Widget", 3, dec("9.99")).await.unwrap();
    let view = h.service.get_cart(&u1()).await.unwrap();
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].quantity, 5);
    assert_eq!(view.total(), dec("49.95"));

    let outcome = h.service.checkout(&u1()).await.unwrap();
    let CheckoutOutcome::CheckedOut { checkout_id, items } = outcome else {
        unreachable!("non-empty cart must check out");
    };
    assert_eq!(items, vec![LineItem::new("p1", "Widget", 5, dec("9.99"))]);

    let events = h.published_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].checkout_id(), Some(checkout_id));
    assert_eq!(events[0].items(), items.as_slice());

    assert!(h.store.stored("u1").is_none());
    assert!(!h.cache.contains("u1"));

    let after = h.service.get_cart(&u1()).await.unwrap();
    assert!(after.items.is_empty());
}

#[tokio::test]
async fn get_cart_materializes_empty_cart_and_caches_it() {
    let h = harness();

    let view = h.service.get_cart(&u1()).await.unwrap();

    assert_eq!(view, CartView::empty(u1()));
    assert!(h.store.stored("u1").is_some());
    assert_eq!(h.cached_view("u1"), Some(view));
    assert_eq!(h.cache.ttl("u1"), Some(Duration::from_secs(86_400)));
}

#[tokio::test]
async fn get_cart_prefers_cache_even_when_stale() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 1, dec("1.00")).await.unwrap();

    let stale = CartView {
        user_id: u1(),
        items: vec![LineItem::new("p9", "Old", 7, dec("3.00"))],
    };
    h.cache.insert_raw("u1", &stale.to_json().unwrap());

    assert_eq!(h.service.get_cart(&u1()).await.unwrap(), stale);
}

#[tokio::test]
async fn corrupt_cache_entry_is_a_miss_and_gets_replaced() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 2, dec("9.99")).await.unwrap();
    h.cache.insert_raw("u1", "{\"userId\": \"u1\", \"items\": [{\"productId\"");

    let view = h.service.get_cart(&u1()).await.unwrap();

    assert_eq!(view.items[0].quantity, 2);
    assert_eq!(h.cached_view("u1"), Some(view));
}

#[tokio::test]
async fn cache_outage_never_reaches_the_caller() {
    let h = harness();
    h.cache.set_unavailable(true);

    let added = h.service.add_item(&u1(), "p1", "Widget", 2, dec("9.99")).await.unwrap();
    let read = h.service.get_cart(&u1()).await.unwrap();
    let removed = h.service.remove_item(&u1(), "p1").await.unwrap();

    assert_eq!(added, read);
    assert!(removed.is_removed());
    assert!(h.store.stored("u1").unwrap().is_empty());
}

#[tokio::test]
async fn cache_write_failure_keeps_store_write() {
    let h = harness();
    h.service.get_cart(&u1()).await.unwrap();
    h.cache.fail_writes(true);

    h.service.add_item(&u1(), "p1", "Widget", 2, dec("9.99")).await.unwrap();

    assert_eq!(h.store.stored("u1").unwrap().item("p1").unwrap().quantity(), 2);
    assert!(h.cached_view("u1").unwrap().items.is_empty());
}

#[tokio::test]
async fn store_write_failure_is_surfaced_and_cache_untouched() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 1, dec("1.00")).await.unwrap();
    let cached = h.cached_view("u1");
    h.store.fail_writes(true);

    let err = h
        .service
        .add_item(&u1(), "p1", "Widget", 1, dec("1.00"))
        .await
        .unwrap_err();

    assert!(matches!(err, CartServiceError::Store(StoreError::Database(_))));
    assert_eq!(h.cached_view("u1"), cached);
}

#[tokio::test]
async fn zero_quantity_add_is_a_no_op() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 2, dec("9.99")).await.unwrap();
    let saves = h.store.save_count();

    let view = h.service.add_item(&u1(), "p1", "Widget", 0, dec("9.99")).await.unwrap();

    assert_eq!(view.items[0].quantity, 2);
    assert_eq!(h.store.save_count(), saves);
}

#[tokio::test]
async fn negative_price_is_invalid() {
    let h = harness();

    let err = h
        .service
        .add_item(&u1(), "p1", "Widget", 1, dec("-1.00"))
        .await
        .unwrap_err();

    assert!(matches!(err, CartServiceError::Invalid(_)));
}

#[tokio::test]
async fn add_beyond_max_quantity_is_invalid_and_stores_nothing() {
    let h = harness();
    h.service
        .add_item(&u1(), "p1", "Widget", MAX_QUANTITY, dec("1.00"))
        .await
        .unwrap();
    let saves = h.store.save_count();
    let before_cache = h.cache.raw("u1");

    let err = h
        .service
        .add_item(&u1(), "p1", "Widget", 1, dec("1.00"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CartServiceError::Invalid(CartError::QuantityOverflow { .. })
    ));
    assert_eq!(h.store.save_count(), saves);
    assert_eq!(
        h.store.stored("u1").unwrap().item("p1").unwrap().quantity(),
        MAX_QUANTITY
    );
    assert_eq!(h.cache.raw("u1"), before_cache);
}

#[tokio::test]
async fn remove_on_missing_cart_or_item_changes_nothing() {
    let h = harness();

    assert_eq!(
        h.service.remove_item(&u1(), "p1").await.unwrap(),
        RemoveOutcome::CartNotFound
    );
    assert!(h.store.is_empty());
    assert!(!h.cache.contains("u1"));

    h.service.add_item(&u1(), "p1", "Widget", 1, dec("1.00")).await.unwrap();
    let before_store = h.store.stored("u1");
    let before_cache = h.cache.raw("u1");

    assert_eq!(
        h.service.remove_item(&u1(), "p2").await.unwrap(),
        RemoveOutcome::ItemNotFound
    );
    assert_eq!(h.store.stored("u1"), before_store);
    assert_eq!(h.cache.raw("u1"), before_cache);
}

#[tokio::test]
async fn remove_refreshes_cache() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 1, dec("1.00")).await.unwrap();
    h.service.add_item(&u1(), "p2", "Gadget", 1, dec("2.00")).await.unwrap();

    let outcome = h.service.remove_item(&u1(), "p1").await.unwrap();

    let RemoveOutcome::Removed(view) = outcome else {
        unreachable!("item is present");
    };
    assert_eq!(view.items.len(), 1);
    assert_eq!(h.cached_view("u1"), Some(view));
}

#[tokio::test]
async fn checkout_of_missing_or_empty_cart_publishes_nothing() {
    let h = harness();

    assert_eq!(
        h.service.checkout(&u1()).await.unwrap(),
        CheckoutOutcome::NothingToCheckout
    );

    h.service.get_cart(&u1()).await.unwrap();
    assert_eq!(
        h.service.checkout(&u1()).await.unwrap(),
        CheckoutOutcome::NothingToCheckout
    );

    assert!(h.broker.published("cart.checkout").is_empty());
    assert!(h.store.stored("u1").is_some());
}

#[tokio::test]
async fn failed_publish_leaves_cart_and_cache_untouched() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 2, dec("9.99")).await.unwrap();
    let before_store = h.store.stored("u1");
    let before_cache = h.cache.raw("u1");
    h.broker.fail_publishes(true);

    let err = h.service.checkout(&u1()).await.unwrap_err();

    assert!(matches!(err, CartServiceError::Publish(PublishError::Broker(_))));
    assert_eq!(h.store.stored("u1"), before_store);
    assert_eq!(h.cache.raw("u1"), before_cache);
    assert_eq!(h.store.delete_count(), 0);
}

#[tokio::test]
async fn checkout_publishes_before_deleting() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 2, dec("9.99")).await.unwrap();
    h.store.fail_writes(true);

    let err = h.service.checkout(&u1()).await.unwrap_err();

    assert!(matches!(err, CartServiceError::Store(_)));
    assert_eq!(h.published_events().len(), 1);
    assert!(h.store.stored("u1").is_some());
}

#[tokio::test]
async fn checkout_keeps_items_added_after_snapshot() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 2, dec("9.99")).await.unwrap();
    let mut newer = h.store.stored("u1").unwrap();
    newer.add_item("p1", "Widget", 1, dec("9.99")).unwrap();
    newer.add_item("p2", "Gadget", 1, dec("3.00")).unwrap();
    h.store.write_before_next_delete(newer);

    let outcome = h.service.checkout(&u1()).await.unwrap();

    let CheckoutOutcome::CheckedOut { items, .. } = outcome else {
        unreachable!("cart has items");
    };
    assert_eq!(items, vec![LineItem::new("p1", "Widget", 2, dec("9.99"))]);
    assert_eq!(h.published_events().len(), 1);

    let stored = h.store.stored("u1").unwrap();
    assert_eq!(stored.items().len(), 2);
    assert_eq!(stored.item("p1").unwrap().quantity(), 1);
    assert_eq!(stored.item("p2").unwrap().quantity(), 1);
    assert_eq!(h.cached_view("u1"), Some(stored.view()));
}

#[tokio::test]
async fn checkout_survives_cache_eviction_failure() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 2, dec("9.99")).await.unwrap();
    h.cache.fail_writes(true);

    let outcome = h.service.checkout(&u1()).await.unwrap();

    assert!(matches!(outcome, CheckoutOutcome::CheckedOut { .. }));
    assert!(h.store.stored("u1").is_none());
}

#[tokio::test]
async fn checkout_queue_is_declared_transient() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 1, dec("1.00")).await.unwrap();
    h.service.checkout(&u1()).await.unwrap();

    assert_eq!(h.broker.declared("cart.checkout"), Some(QueueSpec::checkout()));
    h.broker.declare_queue(&QueueSpec::checkout()).await.unwrap();
}

#[tokio::test]
async fn version_conflicts_are_retried() {
    let h = harness();
    h.service.add_item(&u1(), "p1", "Widget", 1, dec("1.00")).await.unwrap();
    h.store.inject_conflicts(3);

    let view = h.service.add_item(&u1(), "p1", "Widget", 1, dec("1.00")).await.unwrap();

    assert_eq!(view.items[0].quantity, 2);
}

#[tokio::test]
async fn exhausted_conflict_retries_surface_as_store_error() {
    let h = harness_with(CartServiceConfig::default().with_write_retry(RetryPolicy::immediate(1)));
    h.service.add_item(&u1(), "p1", "Widget", 1, dec("1.00")).await.unwrap();
    h.store.inject_conflicts(2);

    let err = h
        .service
        .add_item(&u1(), "p1", "Widget", 1, dec("1.00"))
        .await
        .unwrap_err();

    assert!(matches!(err, CartServiceError::Store(StoreError::Conflict { .. })));
    assert_eq!(h.store.stored("u1").unwrap().item("p1").unwrap().quantity(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_adds_for_one_user_lose_no_increment() {
    let h = harness_with(CartServiceConfig::default().with_write_retry(RetryPolicy::immediate(100)));
    h.service.get_cart(&u1()).await.unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let service = Arc::clone(&h.service);
            tokio::spawn(async move {
                service
                    .add_item(&UserId::new("u1"), "p1", "Widget", 1, "1.00".parse().unwrap())
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.store.stored("u1").unwrap().item("p1").unwrap().quantity(), 16);
    assert_eq!(h.service.get_cart(&u1()).await.unwrap().items.len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn distinct_products_round_trip_through_store_and_cache(
        adds in prop::collection::btree_map("[a-z]{1,4}", (1u32..50, 0i64..10_000), 1..12)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let h = harness();
            for (product, (quantity, cents)) in &adds {
                h.service
                    .add_item(&u1(), product, "Thing", *quantity, Decimal::new(*cents, 2))
                    .await
                    .unwrap();
            }

            let view = h.service.get_cart(&u1()).await.unwrap();
            let stored = h.store.stored("u1").unwrap().view();
            let as_map = |v: &CartView| -> BTreeMap<String, (u32, Decimal)> {
                v.items.iter().map(|i| (i.product_id.clone(), (i.quantity, i.price))).collect()
            };

            let expected: BTreeMap<String, (u32, Decimal)> = adds
                .iter()
                .map(|(p, (q, c))| (p.clone(), (*q, Decimal::new(*c, 2))))
                .collect();
            assert_eq!(as_map(&view), expected);
            assert_eq!(as_map(&stored), expected);
            assert_eq!(h.cached_view("u1").map(|v| as_map(&v)), Some(expected));
        });
    }

    #[test]
    fn repeated_adds_sum_into_one_line(quantities in prop::collection::vec(1u32..100, 1..10)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let h = harness();
            for quantity in &quantities {
                h.service.add_item(&u1(), "p1", "Widget", *quantity, Decimal::new(999, 2)).await.unwrap();
            }

            let view = h.service.get_cart(&u1()).await.unwrap();
            assert_eq!(view.items.len(), 1);
            assert_eq!(view.items[0].quantity, quantities.iter().sum::<u32>());
        });
    }
}
