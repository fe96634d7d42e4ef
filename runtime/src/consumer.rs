//! Checkout consumer: turns checkout events into orders.
//!
//! # Per-message state machine
//!
//! ```text
//! Received ──decode fails / no items──▶ Malformed ──▶ ack (dropped)
//!    │
//!    ▼
//! WellFormed ──▶ Persisting ──created / duplicate──▶ ack
//!                    │
//!                    └──store error──┬── attempt < max ──▶ nack(requeue) after backoff
//!                                    └── attempt = max ──▶ dead-letter, ack
//!                                                          (dead-letter fails: nack(requeue))
//! ```
//!
//! A requeue the broker does not confirm stops the consumer with
//! [`ConsumerError::Settle`]. The message is still unsettled at the broker, and
//! settling anything after it could skip it (Kafka commits are positional), so
//! the subscription is dropped and the message comes back on reconnect.
//!
//! Order creation is idempotent (see [`OrderStore::create_order`]), so a message
//! redelivered after its order was written is acked as a duplicate.
//!
//! Messages are handled one at a time. On shutdown the loop finishes the message
//! in hand, drops its subscription and settles nothing further.

use crate::config::ConsumerConfig;
use crate::metrics::CheckoutMetrics;
use cartflow_core::environment::Clock;
use cartflow_core::{
    BrokerError, CheckoutEvent, DeadLetterSink, Delivery, FailedCheckout, MessageBroker, NewOrder,
    OrderCreation, OrderId, OrderStore, StoreError,
};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Errors that stop the consumer before it processes anything.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The queue could not be declared (unreachable broker or mismatched queue)
    #[error("Failed to declare checkout queue: {0}")]
    Declare(BrokerError),

    /// Consuming could not be started
    #[error("Failed to subscribe to checkout queue: {0}")]
    Subscribe(BrokerError),

    /// A message could not be returned to the queue
    #[error("Failed to requeue checkout message: {0}")]
    Settle(BrokerError),
}

/// What happened to a single delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// A new order was written and the message acked
    OrderCreated(OrderId),
    /// The order already existed; the message was acked
    Duplicate(OrderId),
    /// The payload was unusable; the message was acked and dropped
    Malformed,
    /// Persisting failed; the message was returned to the queue
    Requeued {
        /// The attempt that failed
        attempt: u32,
    },
    /// Persisting failed and the broker did not take the message back; it is
    /// still unsettled
    RequeueFailed {
        /// The attempt that failed
        attempt: u32,
        /// Why the requeue failed
        error: BrokerError,
    },
    /// Attempts are exhausted; the message was recorded in the dead-letter ledger
    /// and acked
    DeadLettered {
        /// Ledger entry id
        entry_id: i64,
    },
}

/// Long-lived subscriber that persists checkout events as orders.
///
/// # Example
///
/// ```rust,ignore
/// let (mut consumer, shutdown) = CheckoutConsumer::new(
///     broker,
///     PostgresOrderStore::new(pool.clone()),
///     DeadLetterQueue::new(pool),
///     Arc::new(SystemClock),
///     ConsumerConfig::default(),
/// );
///
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.send(true).ok();
/// });
///
/// consumer.start().await?;
/// ```
pub struct CheckoutConsumer<O, D> {
    broker: Arc<dyn MessageBroker>,
    orders: O,
    dead_letters: D,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<O, D> CheckoutConsumer<O, D>
where
    O: OrderStore,
    D: DeadLetterSink,
{
    /// Create a consumer.
    ///
    /// Returns the consumer and a shutdown sender. Send `true` to stop it.
    #[must_use]
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        orders: O,
        dead_letters: D,
        clock: Arc<dyn Clock>,
        config: ConsumerConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = Self {
            broker,
            orders,
            dead_letters,
            clock,
            config,
            shutdown: shutdown_rx,
        };

        (consumer, shutdown_tx)
    }

    /// Declares the queue and processes deliveries until shutdown or until the
    /// broker ends the stream.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::Declare`] / [`ConsumerError::Subscribe`] if the queue
    ///   cannot be declared or consumed
    /// - [`ConsumerError::Settle`] if a failed message could not be requeued
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        let queue = self.config.queue.clone();

        self.broker
            .declare_queue(&queue)
            .await
            .map_err(ConsumerError::Declare)?;
        let mut deliveries = self
            .broker
            .consume(&queue)
            .await
            .map_err(ConsumerError::Subscribe)?;

        tracing::info!(
            queue = %queue.name,
            max_attempts = self.config.redelivery.max_attempts(),
            "Checkout consumer started"
        );

        while !*self.shutdown.borrow() {
            tokio::select! {
                next = deliveries.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            if let DeliveryOutcome::RequeueFailed { error, .. } =
                                self.handle_delivery(delivery).await
                            {
                                tracing::error!(
                                    queue = %queue.name,
                                    error = %error,
                                    "Requeue failed, stopping consumer"
                                );
                                return Err(ConsumerError::Settle(error));
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!(queue = %queue.name, error = %e, "Delivery stream error");
                        }
                        None => {
                            tracing::info!(queue = %queue.name, "Delivery stream ended");
                            break;
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!(queue = %queue.name, "Shutdown signal received");
                        break;
                    }
                }
            }
        }

        drop(deliveries);
        tracing::info!(queue = %queue.name, "Checkout consumer stopped");
        Ok(())
    }

    /// Runs one delivery through the state machine and settles it.
    pub async fn handle_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let event = match CheckoutEvent::from_payload(delivery.payload()) {
            Ok(event) => event,
            Err(e) => {
                CheckoutMetrics::record_malformed();
                tracing::warn!(
                    delivery_id = delivery.delivery_id(),
                    error = %e,
                    "Dropping malformed checkout message"
                );
                ack(delivery).await;
                return DeliveryOutcome::Malformed;
            }
        };

        let order = NewOrder::from_event(&event, self.clock.now());
        let key = order.idempotency_key();

        match self.orders.create_order(order).await {
            Ok(OrderCreation::Created(order)) => {
                CheckoutMetrics::record_order_created();
                tracing::info!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    key = %key,
                    total = %order.total(),
                    "Order created"
                );
                ack(delivery).await;
                DeliveryOutcome::OrderCreated(order.id)
            }
            Ok(OrderCreation::Duplicate(order_id)) => {
                CheckoutMetrics::record_duplicate();
                tracing::info!(
                    order_id = %order_id,
                    key = %key,
                    attempt = delivery.attempt(),
                    "Duplicate checkout delivery, order already exists"
                );
                ack(delivery).await;
                DeliveryOutcome::Duplicate(order_id)
            }
            Err(e) => self.handle_persist_failure(delivery, &e).await,
        }
    }

    async fn handle_persist_failure(&self, delivery: Delivery, error: &StoreError) -> DeliveryOutcome {
        let attempt = delivery.attempt();
        let policy = &self.config.redelivery;

        let attempt_index = usize::try_from(attempt).unwrap_or(usize::MAX);

        if attempt_index < policy.max_attempts() {
            let delay = policy.delay_for_attempt(attempt_index.saturating_sub(1));
            tracing::error!(
                delivery_id = delivery.delivery_id(),
                attempt,
                delay_ms = delay.as_millis(),
                error = %error,
                "Failed to persist order, requeueing"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            return self.requeue(delivery).await;
        }

        let failed = FailedCheckout {
            queue: self.config.queue.name.clone(),
            delivery_id: delivery.delivery_id().to_string(),
            payload: delivery.payload().to_vec(),
            error_message: error.to_string(),
            attempts: attempt,
            failed_at: self.clock.now(),
        };

        match self.dead_letters.record(failed).await {
            Ok(entry_id) => {
                CheckoutMetrics::record_dead_lettered();
                tracing::warn!(
                    delivery_id = delivery.delivery_id(),
                    attempt,
                    entry_id,
                    error = %error,
                    "Checkout message exhausted its attempts, dead-lettered"
                );
                ack(delivery).await;
                DeliveryOutcome::DeadLettered { entry_id }
            }
            Err(dl_error) => {
                tracing::error!(
                    delivery_id = delivery.delivery_id(),
                    attempt,
                    error = %dl_error,
                    "Failed to dead-letter checkout message, requeueing"
                );
                self.requeue(delivery).await
            }
        }
    }

    async fn requeue(&self, delivery: Delivery) -> DeliveryOutcome {
        let attempt = delivery.attempt();
        match settle(delivery, Settlement::Requeue).await {
            Ok(()) => {
                CheckoutMetrics::record_requeued();
                DeliveryOutcome::Requeued { attempt }
            }
            Err(error) => DeliveryOutcome::RequeueFailed { attempt, error },
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Settlement {
    Ack,
    Requeue,
}

/// Acks a delivery. A failed ack is logged by [`settle`] and only leads to a
/// redelivery.
async fn ack(delivery: Delivery) {
    let _ = settle(delivery, Settlement::Ack).await;
}

/// Settles a delivery, logging failures.
///
/// A failed ack only risks a redelivery, which order creation absorbs. A failed
/// requeue is returned so the caller can stop.
async fn settle(delivery: Delivery, settlement: Settlement) -> Result<(), BrokerError> {
    let delivery_id = delivery.delivery_id().to_string();
    let result = match settlement {
        Settlement::Ack => delivery.ack().await,
        Settlement::Requeue => delivery.nack(true).await,
    };
    if let Err(e) = &result {
        tracing::error!(
            delivery_id = %delivery_id,
            settlement = ?settlement,
            error = %e,
            "Failed to settle checkout delivery"
        );
    }
    result
}
