//! Checkout publisher.
//!
//! Serializes a [`CheckoutEvent`] and hands it to the shared broker connection.
//! The queue is declared on first use and the declaration is remembered; a failed
//! declaration is retried on the next publish.
//!
//! Every failure propagates to the caller. Nothing is retried here: the cart
//! service fails the checkout and the user can retry it.

use crate::metrics::CheckoutMetrics;
use cartflow_core::{BrokerError, CheckoutEvent, MessageBroker, QueueSpec};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Errors that abort a publish.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The event could not be encoded
    #[error("Failed to serialize checkout event: {0}")]
    Serialization(String),

    /// Declaration or publish failed at the broker
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Publishes checkout events to a single queue.
pub struct CheckoutPublisher {
    broker: Arc<dyn MessageBroker>,
    queue: QueueSpec,
    declared: OnceCell<()>,
}

impl CheckoutPublisher {
    /// Publisher for the standard checkout queue
    #[must_use]
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self::with_queue(broker, QueueSpec::checkout())
    }

    /// Publisher for a custom queue
    #[must_use]
    pub fn with_queue(broker: Arc<dyn MessageBroker>, queue: QueueSpec) -> Self {
        Self {
            broker,
            queue,
            declared: OnceCell::new(),
        }
    }

    /// Queue this publisher writes to
    #[must_use]
    pub const fn queue(&self) -> &QueueSpec {
        &self.queue
    }

    /// Declares the queue unless a previous call already succeeded.
    ///
    /// # Errors
    ///
    /// Returns the broker's declaration error, including
    /// [`BrokerError::QueueMismatch`] for a misconfigured queue.
    pub async fn ensure_declared(&self) -> Result<(), PublishError> {
        self.declared
            .get_or_try_init(|| async {
                self.broker.declare_queue(&self.queue).await?;
                tracing::debug!(queue = %self.queue.name, "Declared checkout queue");
                Ok::<(), BrokerError>(())
            })
            .await?;
        Ok(())
    }

    /// Publishes an event and waits for broker confirmation.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Serialization`] if the event cannot be encoded
    /// - [`PublishError::Broker`] on declaration, connection or publish failure
    pub async fn publish(&self, event: &CheckoutEvent) -> Result<(), PublishError> {
        let result = self.try_publish(event).await;

        match &result {
            Ok(()) => {
                CheckoutMetrics::record_published();
                tracing::info!(
                    user_id = %event.user_id(),
                    checkout_id = ?event.checkout_id(),
                    queue = %self.queue.name,
                    items = event.items().len(),
                    "Published checkout event"
                );
            }
            Err(e) => {
                CheckoutMetrics::record_publish_failure();
                tracing::error!(
                    user_id = %event.user_id(),
                    checkout_id = ?event.checkout_id(),
                    queue = %self.queue.name,
                    error = %e,
                    "Failed to publish checkout event"
                );
            }
        }

        result
    }

    async fn try_publish(&self, event: &CheckoutEvent) -> Result<(), PublishError> {
        let payload = event
            .to_payload()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        self.ensure_declared().await?;
        self.broker.publish(&self.queue.name, &payload).await?;
        Ok(())
    }
}
