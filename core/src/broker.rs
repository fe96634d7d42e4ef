//! Message broker abstraction for checkout events.
//!
//! The broker carries opaque payloads on named queues with explicit (manual)
//! acknowledgement and at-least-once delivery:
//!
//! ```text
//! CheckoutPublisher ──publish──▶ [ cart.checkout ] ──consume──▶ CheckoutConsumer
//!                                       ▲                           │
//!                                       └──── nack(requeue=true) ───┤
//!                                                                   └── ack
//! ```
//!
//! # Lifecycle
//!
//! A broker is a long-lived, process-wide component. It is connected once, shared
//! as `Arc<dyn MessageBroker>`, and released with [`MessageBroker::shutdown`].
//! After shutdown every operation fails with [`BrokerError::Closed`].
//!
//! # Queue Declaration
//!
//! Declaring a queue is idempotent: redeclaring with identical [`QueueSpec`]
//! parameters is a no-op, redeclaring with different ones is
//! [`BrokerError::QueueMismatch`].

use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Name of the queue checkout events travel on.
pub const CHECKOUT_QUEUE: &str = "cart.checkout";

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A queue was redeclared with different parameters
    #[error("Queue '{queue}' already declared with different parameters: {reason}")]
    QueueMismatch {
        /// The queue being declared
        queue: String,
        /// Which parameter differs
        reason: String,
    },

    /// Failed to hand a message to the broker
    #[error("Publish failed for queue '{queue}': {reason}")]
    PublishFailed {
        /// Target queue
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to start consuming
    #[error("Subscription failed for queue '{queue}': {reason}")]
    SubscriptionFailed {
        /// Source queue
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// An ack or nack could not be delivered
    #[error("Acknowledge failed for delivery '{delivery_id}': {reason}")]
    AcknowledgeFailed {
        /// The delivery being settled
        delivery_id: String,
        /// The reason for failure
        reason: String,
    },

    /// The broker has been shut down
    #[error("Broker is closed")]
    Closed,

    /// The backend cannot honour a requested option
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Queue declaration parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Survive broker restarts
    pub durable: bool,
    /// Restricted to the declaring connection
    pub exclusive: bool,
    /// Deleted when the last consumer goes away
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A non-durable, non-exclusive, non-auto-delete queue
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// The checkout queue as both producer and consumer declare it
    #[must_use]
    pub fn checkout() -> Self {
        Self::new(CHECKOUT_QUEUE)
    }

    /// Sets durability
    #[must_use]
    pub const fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Describes the first parameter that differs from `other`, if any.
    #[must_use]
    pub fn mismatch(&self, other: &Self) -> Option<String> {
        if self.durable != other.durable {
            return Some(format!("durable {} != {}", self.durable, other.durable));
        }
        if self.exclusive != other.exclusive {
            return Some(format!("exclusive {} != {}", self.exclusive, other.exclusive));
        }
        if self.auto_delete != other.auto_delete {
            return Some(format!(
                "auto_delete {} != {}",
                self.auto_delete, other.auto_delete
            ));
        }
        None
    }
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self::checkout()
    }
}

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Settles a single delivery with the broker that produced it.
pub trait Acknowledger: Send + Sync {
    /// Removes the message from the queue.
    fn ack(&self) -> BrokerFuture<'_, ()>;

    /// Rejects the message, optionally returning it to the queue for redelivery.
    ///
    /// A failed requeue leaves the message unsettled: the broker must still hold
    /// it for redelivery once the consumer reconnects, and the caller must stop
    /// settling later messages on this subscription.
    fn nack(&self, requeue: bool) -> BrokerFuture<'_, ()>;
}

/// A message handed to a consumer. Must be settled with [`ack`](Self::ack) or
/// [`nack`](Self::nack); both consume the delivery.
pub struct Delivery {
    delivery_id: String,
    payload: Vec<u8>,
    attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wraps a received message
    #[must_use]
    pub fn new(
        delivery_id: impl Into<String>,
        payload: Vec<u8>,
        attempt: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            payload,
            attempt,
            acker,
        }
    }

    /// Broker-assigned identifier, unique per delivery (not per logical message)
    #[must_use]
    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    /// Raw message body
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// 1-based delivery attempt for this logical message
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AcknowledgeFailed`] or [`BrokerError::Closed`].
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Negatively acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AcknowledgeFailed`] or [`BrokerError::Closed`].
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_id", &self.delivery_id)
            .field("payload_len", &self.payload.len())
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Broker connection shared by publishers and consumers.
///
/// Uses boxed futures so the broker can be held as `Arc<dyn MessageBroker>`.
pub trait MessageBroker: Send + Sync {
    /// Declares a queue idempotently.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::QueueMismatch`] if it exists with different parameters
    /// - [`BrokerError::Unsupported`] if the backend cannot express the parameters
    /// - [`BrokerError::ConnectionFailed`] / [`BrokerError::Closed`]
    fn declare_queue(&self, spec: &QueueSpec) -> BrokerFuture<'_, ()>;

    /// Publishes a payload and resolves once the broker has confirmed it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] or [`BrokerError::Closed`].
    fn publish(&self, queue: &str, payload: &[u8]) -> BrokerFuture<'_, ()>;

    /// Starts consuming in manual-ack mode.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] or [`BrokerError::Closed`].
    fn consume(&self, spec: &QueueSpec) -> BrokerFuture<'_, DeliveryStream>;

    /// Flushes outstanding work and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if pending messages could not be flushed.
    fn shutdown(&self) -> BrokerFuture<'_, ()>;
}
