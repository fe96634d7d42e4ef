//! Integration tests for [`RedpandaBroker`] with a real Kafka instance.
//!
//! These tests use testcontainers to start Kafka and validate:
//! - Idempotent queue declaration
//! - Publish / consume / ack round trip
//! - Requeue with an incremented attempt counter
//! - Redelivery of unsettled messages to the next consumer
//! - Shutdown semantics
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p cartflow-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use cartflow_core::{BrokerError, Delivery, DeliveryStream, MessageBroker, QueueSpec};
use cartflow_redpanda::RedpandaBroker;
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

/// Start Kafka and return its bootstrap address once it accepts metadata requests.
async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "false")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");

    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        let warmup = broker(&brokers, "warmup");
        if warmup.declare_queue(&QueueSpec::new("warmup")).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return (kafka, brokers);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
    unreachable!()
}

fn broker(brokers: &str, group: &str) -> RedpandaBroker {
    RedpandaBroker::builder()
        .brokers(brokers)
        .consumer_group(group)
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to create broker")
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    loop {
        let item = tokio::time::timeout(Duration::from_secs(30), stream.next())
            .await
            .expect("Timed out waiting for delivery")
            .expect("Stream ended");
        // Receive errors during group rebalance are transient.
        if let Ok(delivery) = item {
            return delivery;
        }
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_declare_is_idempotent() {
    let (_kafka, brokers) = start_kafka().await;
    let broker = broker(&brokers, "declare");
    let spec = QueueSpec::checkout();

    broker.declare_queue(&spec).await.expect("first declare");
    broker.declare_queue(&spec).await.expect("redeclare");

    // A second process declaring the same topic sees it as existing.
    let other = self::broker(&brokers, "declare");
    other.declare_queue(&spec).await.expect("declare from another client");

    let result = broker.declare_queue(&spec.clone().with_durable(true)).await;
    assert!(matches!(result, Err(BrokerError::QueueMismatch { .. })));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_publish_consume_ack_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let broker = broker(&brokers, "round-trip");
    let spec = QueueSpec::checkout();
    broker.declare_queue(&spec).await.unwrap();

    broker.publish(&spec.name, b"first").await.unwrap();
    broker.publish(&spec.name, b"second").await.unwrap();

    let mut stream = broker.consume(&spec).await.unwrap();
    let first = next(&mut stream).await;
    assert_eq!(first.payload(), b"first");
    assert_eq!(first.attempt(), 1);
    first.ack().await.unwrap();

    let second = next(&mut stream).await;
    assert_eq!(second.payload(), b"second");
    second.ack().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_requeue_increments_attempt() {
    let (_kafka, brokers) = start_kafka().await;
    let broker = broker(&brokers, "requeue");
    let spec = QueueSpec::checkout();
    broker.declare_queue(&spec).await.unwrap();
    broker.publish(&spec.name, b"payload").await.unwrap();

    let mut stream = broker.consume(&spec).await.unwrap();
    let first = next(&mut stream).await;
    assert_eq!(first.attempt(), 1);
    first.nack(true).await.unwrap();

    let second = next(&mut stream).await;
    assert_eq!(second.payload(), b"payload");
    assert_eq!(second.attempt(), 2);
    second.ack().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unsettled_message_is_redelivered() {
    let (_kafka, brokers) = start_kafka().await;
    let spec = QueueSpec::checkout();

    let publisher = broker(&brokers, "redelivery");
    publisher.declare_queue(&spec).await.unwrap();
    publisher.publish(&spec.name, b"unsettled").await.unwrap();

    {
        let crashed = broker(&brokers, "redelivery");
        let mut stream = crashed.consume(&spec).await.unwrap();
        let delivery = next(&mut stream).await;
        assert_eq!(delivery.payload(), b"unsettled");
        // Dropped without ack, as when the worker dies mid-message.
        drop(delivery);
    }

    let survivor = broker(&brokers, "redelivery");
    let mut stream = survivor.consume(&spec).await.unwrap();
    let delivery = next(&mut stream).await;
    assert_eq!(delivery.payload(), b"unsettled");
    delivery.ack().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_shutdown_closes_broker() {
    let (_kafka, brokers) = start_kafka().await;
    let broker = broker(&brokers, "shutdown");
    let spec = QueueSpec::checkout();
    broker.declare_queue(&spec).await.unwrap();
    let mut stream = broker.consume(&spec).await.unwrap();

    broker.shutdown().await.unwrap();
    broker.shutdown().await.expect("shutdown is idempotent");

    let ended = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("stream ends after shutdown");
    assert!(ended.is_none());
    assert_eq!(
        broker.publish(&spec.name, b"late").await,
        Err(BrokerError::Closed)
    );
}
