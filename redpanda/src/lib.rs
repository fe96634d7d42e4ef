//! Redpanda message broker for the cart checkout pipeline.
//!
//! Implements [`MessageBroker`] over the Kafka protocol with rdkafka, so it works
//! against Redpanda, Apache Kafka or any compatible service.
//!
//! # Queue Mapping
//!
//! ```text
//! queue                 ─▶ topic
//! declare_queue         ─▶ CreateTopics (existing topic with matching partitions is a no-op)
//! publish               ─▶ produce, awaiting broker acknowledgement
//! consume               ─▶ consumer group subscription, auto-commit disabled
//! ack                   ─▶ commit offset + 1
//! nack(requeue = true)  ─▶ re-produce with x-delivery-attempt + 1, then commit
//! nack(requeue = false) ─▶ commit (message dropped)
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once**: offsets are committed only when a delivery is settled. If the
//! process stops before settling, the message is delivered again to the next
//! member of the consumer group. A requeued message goes to the back of its
//! partition with its attempt counter incremented; if the process stops between
//! re-producing and committing, both copies are delivered, which idempotent
//! consumers absorb. If the re-produce fails, nothing is committed, the
//! partition is rewound to the message and the nack returns an error.
//!
//! Topics are always persisted by the broker. `durable` controls the replication
//! factor; `exclusive` and `auto_delete` have no Kafka equivalent and are rejected
//! with [`BrokerError::Unsupported`].
//!
//! # Example
//!
//! ```no_run
//! use cartflow_core::{MessageBroker, QueueSpec};
//! use cartflow_redpanda::RedpandaBroker;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker: Arc<dyn MessageBroker> = Arc::new(
//!     RedpandaBroker::builder()
//!         .brokers("localhost:9092")
//!         .consumer_group("order-worker")
//!         .build()?,
//! );
//!
//! broker.declare_queue(&QueueSpec::checkout()).await?;
//! broker.publish("cart.checkout", br#"{"userId":"u1","items":[]}"#).await?;
//! broker.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use cartflow_core::{
    Acknowledger, BrokerError, BrokerFuture, Delivery, DeliveryStream, MessageBroker, QueueSpec,
};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Header carrying the 1-based delivery attempt of a message.
pub const ATTEMPT_HEADER: &str = "x-delivery-attempt";

/// Consumer group used when none is configured.
pub const DEFAULT_CONSUMER_GROUP: &str = "cartflow-checkout";

/// Redpanda-backed [`MessageBroker`].
///
/// One instance holds one producer and one admin client for the lifetime of the
/// process. Every [`consume`](MessageBroker::consume) call creates its own
/// consumer in the configured group.
///
/// # Example
///
/// ```no_run
/// use cartflow_redpanda::RedpandaBroker;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaBroker::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .consumer_group("order-worker")
///     .partitions(6)
///     .replication_factor(3)
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBroker {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    brokers: String,
    timeout: Duration,
    consumer_group: String,
    auto_offset_reset: String,
    partitions: i32,
    replication_factor: i32,
    declared: Mutex<HashMap<String, QueueSpec>>,
    closed: Arc<watch::Sender<bool>>,
}

impl RedpandaBroker {
    /// Create a broker with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the clients cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Bootstrap servers
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group of every subscription
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn replication_for(&self, spec: &QueueSpec) -> i32 {
        if spec.durable {
            self.replication_factor
        } else {
            1
        }
    }

    /// Partition count of an existing topic.
    async fn partition_count(&self, topic: &str) -> Result<usize, BrokerError> {
        let producer = self.producer.clone();
        let topic_name = topic.to_string();
        let timeout = self.timeout;

        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(&topic_name), Timeout::After(timeout))
        })
        .await
        .map_err(|e| BrokerError::ConnectionFailed(format!("Metadata task failed: {e}")))?
        .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to fetch metadata: {e}")))?;

        metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(|t| t.partitions().len())
            .ok_or_else(|| BrokerError::ConnectionFailed(format!("Topic '{topic}' not found")))
    }
}

impl std::fmt::Debug for RedpandaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaBroker")
            .field("brokers", &self.brokers)
            .field("consumer_group", &self.consumer_group)
            .field("partitions", &self.partitions)
            .field("replication_factor", &self.replication_factor)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    partitions: Option<i32>,
    replication_factor: Option<i32>,
}

impl RedpandaBrokerBuilder {
    /// Comma-separated bootstrap servers (e.g. `"localhost:9092"`)
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"1"` or `"all"`.
    ///
    /// Default: `"all"`. A publish only succeeds once the broker confirmed the
    /// message, so weaker modes trade durability for latency.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Bound on sends, admin operations and flushes.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group shared by all consumers of this broker.
    ///
    /// Instances in the same group split the partitions between them, so each
    /// checkout is handled by one worker at a time.
    ///
    /// Default: [`DEFAULT_CONSUMER_GROUP`]
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Where a new consumer group starts reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`, so checkouts published before the first worker
    /// started are not skipped.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Partitions of topics created by `declare_queue`.
    ///
    /// Default: 1
    #[must_use]
    pub const fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Replication factor of durable topics. Transient topics use 1.
    ///
    /// Default: 1
    #[must_use]
    pub const fn replication_factor(mut self, replication_factor: i32) -> Self {
        self.replication_factor = Some(replication_factor);
        self
    }

    /// Build the [`RedpandaBroker`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set, the
    /// topology settings are not positive, or a client cannot be created.
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let partitions = self.partitions.unwrap_or(1);
        let replication_factor = self.replication_factor.unwrap_or(1);
        if partitions < 1 || replication_factor < 1 {
            return Err(BrokerError::ConnectionFailed(format!(
                "Invalid topology: partitions={partitions}, replication_factor={replication_factor}"
            )));
        }

        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to create admin client: {e}"))
            })?;

        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            consumer_group = %consumer_group,
            auto_offset_reset = %auto_offset_reset,
            partitions,
            replication_factor,
            "RedpandaBroker created"
        );

        let (closed, _) = watch::channel(false);

        Ok(RedpandaBroker {
            producer,
            admin,
            brokers,
            timeout,
            consumer_group,
            auto_offset_reset,
            partitions,
            replication_factor,
            declared: Mutex::new(HashMap::new()),
            closed: Arc::new(closed),
        })
    }
}

impl MessageBroker for RedpandaBroker {
    fn declare_queue(&self, spec: &QueueSpec) -> BrokerFuture<'_, ()> {
        let spec = spec.clone();

        Box::pin(async move {
            if self.is_closed() {
                return Err(BrokerError::Closed);
            }
            if spec.exclusive || spec.auto_delete {
                return Err(BrokerError::Unsupported(format!(
                    "Queue '{}': exclusive and auto-delete topics do not exist in Kafka",
                    spec.name
                )));
            }

            {
                let declared = self
                    .declared
                    .lock()
                    .map_err(|_| BrokerError::ConnectionFailed("Lock poisoned".to_string()))?;
                if let Some(existing) = declared.get(&spec.name) {
                    return match existing.mismatch(&spec) {
                        Some(reason) => Err(BrokerError::QueueMismatch {
                            queue: spec.name.clone(),
                            reason,
                        }),
                        None => Ok(()),
                    };
                }
            }

            let topic = NewTopic::new(
                &spec.name,
                self.partitions,
                TopicReplication::Fixed(self.replication_for(&spec)),
            );
            let options = AdminOptions::new().operation_timeout(Some(self.timeout));
            let results = self
                .admin
                .create_topics([&topic], &options)
                .await
                .map_err(|e| {
                    BrokerError::ConnectionFailed(format!("Failed to create topic: {e}"))
                })?;

            for result in results {
                match result {
                    Ok(name) => tracing::info!(queue = %name, "Topic created"),
                    Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        let actual = self.partition_count(&spec.name).await?;
                        let expected = usize::try_from(self.partitions).unwrap_or(0);
                        if actual != expected {
                            return Err(BrokerError::QueueMismatch {
                                queue: spec.name.clone(),
                                reason: format!("partitions {actual} != {expected}"),
                            });
                        }
                        tracing::debug!(queue = %spec.name, "Topic already exists");
                    }
                    Err((name, code)) => {
                        return Err(BrokerError::ConnectionFailed(format!(
                            "Failed to create topic '{name}': {code}"
                        )));
                    }
                }
            }

            self.declared
                .lock()
                .map_err(|_| BrokerError::ConnectionFailed("Lock poisoned".to_string()))?
                .insert(spec.name.clone(), spec);
            Ok(())
        })
    }

    fn publish(&self, queue: &str, payload: &[u8]) -> BrokerFuture<'_, ()> {
        let queue = queue.to_string();
        let payload = payload.to_vec();

        Box::pin(async move {
            if self.is_closed() {
                return Err(BrokerError::Closed);
            }
            let (partition, offset) =
                produce(&self.producer, &queue, &payload, 1, self.timeout).await?;
            tracing::debug!(queue = %queue, partition, offset, "Message published");
            Ok(())
        })
    }

    fn consume(&self, spec: &QueueSpec) -> BrokerFuture<'_, DeliveryStream> {
        let queue = spec.name.clone();

        Box::pin(async move {
            if self.is_closed() {
                return Err(BrokerError::Closed);
            }

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BrokerError::SubscriptionFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[&queue])
                .map_err(|e| BrokerError::SubscriptionFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                queue = %queue,
                consumer_group = %self.consumer_group,
                manual_commit = true,
                "Subscribed to queue"
            );

            let consumer = Arc::new(consumer);
            let producer = self.producer.clone();
            let closed = Arc::clone(&self.closed);
            let mut closed_rx = self.closed.subscribe();
            let timeout = self.timeout;

            let stream = async_stream::stream! {
                loop {
                    let received = tokio::select! {
                        biased;
                        _ = closed_rx.changed() => break,
                        message = consumer.recv() => message.map(|m| Received::from_message(&m)),
                    };

                    match received {
                        Ok(received) => {
                            let acker = KafkaAcker {
                                consumer: Arc::clone(&consumer),
                                producer: producer.clone(),
                                closed: Arc::clone(&closed),
                                timeout,
                                received: received.clone(),
                            };
                            yield Ok(Delivery::new(
                                received.delivery_id(),
                                received.payload,
                                received.attempt,
                                Box::new(acker),
                            ));
                        }
                        Err(e) => {
                            yield Err(BrokerError::SubscriptionFailed {
                                queue: queue.clone(),
                                reason: format!("Failed to receive message: {e}"),
                            });
                        }
                    }
                }
                tracing::debug!(queue = %queue, "Consumer stream closed");
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.send_replace(true) {
                return Ok(());
            }

            let producer = self.producer.clone();
            let timeout = self.timeout;
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| BrokerError::ConnectionFailed(format!("Flush task failed: {e}")))?
                .map_err(|e| {
                    BrokerError::ConnectionFailed(format!("Failed to flush producer: {e}"))
                })?;

            tracing::info!(brokers = %self.brokers, "RedpandaBroker shut down");
            Ok(())
        })
    }
}

/// Owned copy of a consumed message.
#[derive(Clone, Debug)]
struct Received {
    topic: String,
    partition: i32,
    offset: i64,
    payload: Vec<u8>,
    attempt: u32,
}

impl Received {
    fn from_message(message: &BorrowedMessage<'_>) -> Self {
        let attempt = message
            .headers()
            .and_then(|headers| {
                headers
                    .iter()
                    .find(|h| h.key == ATTEMPT_HEADER)
                    .and_then(|h| h.value)
            })
            .map_or(1, parse_attempt);

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            attempt,
        }
    }

    fn delivery_id(&self) -> String {
        format!("{}/{}/{}", self.topic, self.partition, self.offset)
    }
}

/// Attempt counter from a header value; unreadable values count as a first attempt.
fn parse_attempt(value: &[u8]) -> u32 {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .filter(|attempt| *attempt > 0)
        .unwrap_or(1)
}

async fn produce(
    producer: &FutureProducer,
    queue: &str,
    payload: &[u8],
    attempt: u32,
    timeout: Duration,
) -> Result<(i32, i64), BrokerError> {
    let attempt = attempt.to_string();
    let headers = OwnedHeaders::new().insert(Header {
        key: ATTEMPT_HEADER,
        value: Some(attempt.as_str()),
    });
    let record = FutureRecord::<(), [u8]>::to(queue)
        .payload(payload)
        .headers(headers);

    producer
        .send(record, Timeout::After(timeout))
        .await
        .map_err(|(kafka_error, _)| {
            tracing::error!(queue = %queue, error = %kafka_error, "Failed to publish message");
            BrokerError::PublishFailed {
                queue: queue.to_string(),
                reason: kafka_error.to_string(),
            }
        })
}

/// Settles a delivery by committing its offset, re-producing it first on requeue.
struct KafkaAcker {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    closed: Arc<watch::Sender<bool>>,
    timeout: Duration,
    received: Received,
}

impl KafkaAcker {
    fn ack_failed(&self, reason: impl std::fmt::Display) -> BrokerError {
        BrokerError::AcknowledgeFailed {
            delivery_id: self.received.delivery_id(),
            reason: reason.to_string(),
        }
    }

    /// Seeks the partition back to this message after a failed requeue so it
    /// is fetched again instead of being skipped by a later commit.
    fn rewind(&self, cause: BrokerError) -> BrokerError {
        let Received {
            topic,
            partition,
            offset,
            ..
        } = &self.received;
        match self
            .consumer
            .seek(topic, *partition, Offset::Offset(*offset), self.timeout)
        {
            Ok(()) => {
                tracing::warn!(
                    delivery_id = %self.received.delivery_id(),
                    error = %cause,
                    "Requeue failed, partition rewound to the message"
                );
                self.ack_failed(cause)
            }
            Err(seek_error) => {
                tracing::error!(
                    delivery_id = %self.received.delivery_id(),
                    error = %cause,
                    seek_error = %seek_error,
                    "Requeue failed and the partition could not be rewound"
                );
                self.ack_failed(format!("{cause}; rewind failed: {seek_error}"))
            }
        }
    }

    fn commit(&self) -> Result<(), BrokerError> {
        if *self.closed.borrow() {
            return Err(BrokerError::Closed);
        }
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &self.received.topic,
                self.received.partition,
                Offset::Offset(self.received.offset + 1),
            )
            .map_err(|e| self.ack_failed(e))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| self.ack_failed(e))
    }
}

impl Acknowledger for KafkaAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move { self.commit() })
    }

    fn nack(&self, requeue: bool) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if *self.closed.borrow() {
                return Err(BrokerError::Closed);
            }
            if requeue {
                let next_attempt = self.received.attempt.saturating_add(1);
                produce(
                    &self.producer,
                    &self.received.topic,
                    &self.received.payload,
                    next_attempt,
                    self.timeout,
                )
                .await
                .map_err(|e| self.rewind(e))?;
                tracing::debug!(
                    delivery_id = %self.received.delivery_id(),
                    attempt = next_attempt,
                    "Message requeued"
                );
            } else {
                tracing::debug!(
                    delivery_id = %self.received.delivery_id(),
                    "Message rejected"
                );
            }
            self.commit()
        })
    }
}
