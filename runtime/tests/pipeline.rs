//! End-to-end: cart service publishes, consumer persists.

#![allow(clippy::unwrap_used)]

use cartflow_core::{Decimal, MessageBroker, OrderStore, QueueSpec, UserId};
use cartflow_runtime::{
    CartService, CheckoutConsumer, CheckoutOutcome, CheckoutPublisher, ConsumerConfig,
    DeliveryOutcome,
};
use cartflow_testing::{
    InMemoryBroker, InMemoryCartCache, InMemoryCartStore, InMemoryDeadLetterQueue,
    InMemoryOrderStore, init_test_tracing, test_clock,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

struct Pipeline {
    service: CartService<InMemoryCartStore, InMemoryCartCache>,
    consumer: CheckoutConsumer<InMemoryOrderStore, InMemoryDeadLetterQueue>,
    broker: InMemoryBroker,
    orders: InMemoryOrderStore,
    cache: InMemoryCartCache,
}

fn pipeline() -> Pipeline {
    init_test_tracing();
    let broker = InMemoryBroker::new();
    let shared: Arc<dyn MessageBroker> = Arc::new(broker.clone());
    let cache = InMemoryCartCache::new();
    let orders = InMemoryOrderStore::new();

    let service = CartService::new(
        InMemoryCartStore::new(),
        cache.clone(),
        CheckoutPublisher::new(Arc::clone(&shared)),
    );
    let (consumer, _shutdown) = CheckoutConsumer::new(
        shared,
        orders.clone(),
        InMemoryDeadLetterQueue::new(),
        Arc::new(test_clock()),
        ConsumerConfig::default(),
    );

    Pipeline {
        service,
        consumer,
        broker,
        orders,
        cache,
    }
}

impl Pipeline {
    /// Consumes and handles exactly one delivery.
    async fn consume_one(&self) -> DeliveryOutcome {
        let mut stream = self.broker.consume(&QueueSpec::checkout()).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        self.consumer.handle_delivery(delivery).await
    }
}

#[tokio::test]
async fn widget_checkout_becomes_one_order() {
    let p = pipeline();
    let user = UserId::new("u1");

    p.service
        .add_item(&user, "p1", "Widget", 2, Decimal::new(999, 2))
        .await
        .unwrap();
    p.service
        .add_item(&user, "p1", "Widget", 3, Decimal::new(999, 2))
        .await
        .unwrap();
    let outcome = p.service.checkout(&user).await.unwrap();
    assert!(matches!(outcome, CheckoutOutcome::CheckedOut { .. }));

    let DeliveryOutcome::OrderCreated(order_id) = p.consume_one().await else {
        unreachable!("checkout produces an order");
    };

    let orders = p.orders.orders_for_user(&user).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].id, order_id);
    assert_eq!(orders[0].items.len(), 1);
    assert_eq!(orders[0].items[0].quantity, 5);
    assert_eq!(orders[0].total(), Decimal::new(4995, 2));

    assert!(!p.cache.contains("u1"));
    assert!(p.service.get_cart(&user).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn redelivered_checkout_is_persisted_once() {
    let p = pipeline();
    let user = UserId::new("u1");
    p.service
        .add_item(&user, "p1", "Widget", 1, Decimal::new(500, 2))
        .await
        .unwrap();
    p.service.checkout(&user).await.unwrap();

    // Deliver the same published bytes twice, as after a lost ack.
    let published = p.broker.published("cart.checkout");
    assert_eq!(published.len(), 1);
    p.broker.enqueue_raw("cart.checkout", &published[0], 2);

    let first = p.consume_one().await;
    let second = p.consume_one().await;

    let DeliveryOutcome::OrderCreated(id) = first else {
        unreachable!("first delivery creates the order");
    };
    assert_eq!(second, DeliveryOutcome::Duplicate(id));
    assert_eq!(p.orders.len(), 1);
}

#[tokio::test]
async fn separate_checkouts_of_identical_carts_are_separate_orders() {
    let p = pipeline();
    let user = UserId::new("u1");

    for _ in 0..2 {
        p.service
            .add_item(&user, "p1", "Widget", 1, Decimal::new(500, 2))
            .await
            .unwrap();
        p.service.checkout(&user).await.unwrap();
    }

    assert!(matches!(p.consume_one().await, DeliveryOutcome::OrderCreated(_)));
    assert!(matches!(p.consume_one().await, DeliveryOutcome::OrderCreated(_)));
    assert_eq!(p.orders.len(), 2);
}

#[tokio::test]
async fn carts_of_different_users_stay_apart() {
    let p = pipeline();
    let alice = UserId::new("alice");
    let bob = UserId::new("bob");

    p.service
        .add_item(&alice, "p1", "Widget", 1, Decimal::new(100, 2))
        .await
        .unwrap();
    p.service
        .add_item(&bob, "p2", "Gadget", 2, Decimal::new(250, 2))
        .await
        .unwrap();
    p.service.checkout(&alice).await.unwrap();
    p.consume_one().await;

    let bob_cart = p.service.get_cart(&bob).await.unwrap();
    assert_eq!(bob_cart.items.len(), 1);
    assert!(p.orders.orders_for_user(&bob).await.unwrap().is_empty());
    assert_eq!(p.orders.orders_for_user(&alice).await.unwrap().len(), 1);
}
