//! In-memory message broker with manual acknowledgement.
//!
//! Mirrors the queue semantics the pipeline relies on:
//!
//! - declaring a queue twice with different parameters fails,
//! - every delivery stays unacked until it is acked or nacked,
//! - `nack(requeue = true)` puts the message back at the tail with its attempt
//!   counter incremented,
//! - `shutdown` ends every consumer stream and returns unacked messages to their
//!   queues, as closing a channel does,
//! - [`recover`](InMemoryBroker::recover) returns unacked messages without
//!   closing anything, as a consumer reconnect does.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use cartflow_core::{
    Acknowledger, BrokerError, BrokerFuture, Delivery, DeliveryStream, MessageBroker, QueueSpec,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    attempt: u32,
}

#[derive(Debug)]
struct Queue {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: HashMap<String, Message>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    closed: bool,
    fail_publishes: bool,
    fail_declarations: bool,
    fail_settlements: bool,
    next_delivery: u64,
    declarations: u64,
    published: Vec<(String, Vec<u8>)>,
    acked: Vec<String>,
    rejected: Vec<String>,
    requeued: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// In-memory [`MessageBroker`].
///
/// # Example
///
/// ```
/// use cartflow_core::{MessageBroker, QueueSpec};
/// use cartflow_testing::InMemoryBroker;
///
/// # async fn example() -> Result<(), cartflow_core::BrokerError> {
/// let broker = InMemoryBroker::new();
/// broker.declare_queue(&QueueSpec::checkout()).await?;
/// broker.publish("cart.checkout", b"{}").await?;
/// assert_eq!(broker.published("cart.checkout").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create a new broker with no queues
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads successfully published to `queue`, in order
    #[must_use]
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Delivery ids that were acked
    #[must_use]
    pub fn acked(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().acked.clone()
    }

    /// Delivery ids that were nacked without requeue
    #[must_use]
    pub fn rejected(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().rejected.clone()
    }

    /// Delivery ids that were nacked with requeue
    #[must_use]
    pub fn requeued(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().requeued.clone()
    }

    /// Messages waiting in `queue`
    #[must_use]
    pub fn ready_len(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` but not yet settled
    #[must_use]
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Parameters `queue` was declared with
    #[must_use]
    pub fn declared(&self, queue: &str) -> Option<QueueSpec> {
        self.shared
            .state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.spec.clone())
    }

    /// Number of successful `declare_queue` calls
    #[must_use]
    pub fn declaration_count(&self) -> u64 {
        self.shared.state.lock().unwrap().declarations
    }

    /// Whether `shutdown` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    /// Make every publish fail with [`BrokerError::PublishFailed`]
    pub fn fail_publishes(&self, fail: bool) {
        self.shared.state.lock().unwrap().fail_publishes = fail;
    }

    /// Make every declaration fail with [`BrokerError::ConnectionFailed`]
    pub fn fail_declarations(&self, fail: bool) {
        self.shared.state.lock().unwrap().fail_declarations = fail;
    }

    /// Make every ack and nack fail with [`BrokerError::AcknowledgeFailed`].
    ///
    /// The delivery stays unacked, as when the broker never saw the settlement.
    pub fn fail_settlements(&self, fail: bool) {
        self.shared.state.lock().unwrap().fail_settlements = fail;
    }

    /// Puts every unacked message back at the head of its queue with its attempt
    /// counter incremented.
    pub fn recover(&self) {
        let mut state = self.shared.state.lock().unwrap();
        return_unacked(&mut state);
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Enqueues a raw message with a given attempt count, bypassing failure
    /// injection. Declares the queue with default parameters if needed.
    pub fn enqueue_raw(&self, queue: &str, payload: &[u8], attempt: u32) {
        let mut state = self.shared.state.lock().unwrap();
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Queue {
                spec: QueueSpec::new(queue),
                ready: VecDeque::new(),
                unacked: HashMap::new(),
            })
            .ready
            .push_back(Message {
                payload: payload.to_vec(),
                attempt,
            });
        drop(state);
        self.shared.notify.notify_waiters();
    }

    fn declare(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.fail_declarations {
            return Err(BrokerError::ConnectionFailed(
                "injected connection failure".to_string(),
            ));
        }
        if let Some(existing) = state.queues.get(&spec.name) {
            if let Some(reason) = existing.spec.mismatch(spec) {
                return Err(BrokerError::QueueMismatch {
                    queue: spec.name.clone(),
                    reason,
                });
            }
        } else {
            state.queues.insert(
                spec.name.clone(),
                Queue {
                    spec: spec.clone(),
                    ready: VecDeque::new(),
                    unacked: HashMap::new(),
                },
            );
        }
        state.declarations += 1;
        Ok(())
    }

    fn push(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.fail_publishes {
            return Err(BrokerError::PublishFailed {
                queue: queue.to_string(),
                reason: "injected publish failure".to_string(),
            });
        }
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(BrokerError::PublishFailed {
                queue: queue.to_string(),
                reason: "queue not declared".to_string(),
            });
        };
        target.ready.push_back(Message {
            payload: payload.to_vec(),
            attempt: 1,
        });
        state.published.push((queue.to_string(), payload.to_vec()));
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        return_unacked(&mut state);
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

fn return_unacked(state: &mut BrokerState) {
    for queue in state.queues.values_mut() {
        let returned: Vec<Message> = queue.unacked.drain().map(|(_, m)| m).collect();
        for mut message in returned {
            message.attempt += 1;
            queue.ready.push_front(message);
        }
    }
}

enum Next {
    Delivery(Delivery),
    Empty,
    Closed,
    Failed(BrokerError),
}

fn next_delivery(shared: &Arc<Shared>, queue: &str) -> Next {
    let mut state = shared.state.lock().unwrap();
    if state.closed {
        return Next::Closed;
    }
    let delivery_number = state.next_delivery + 1;
    let Some(target) = state.queues.get_mut(queue) else {
        return Next::Failed(BrokerError::SubscriptionFailed {
            queue: queue.to_string(),
            reason: "queue deleted".to_string(),
        });
    };
    let Some(message) = target.ready.pop_front() else {
        return Next::Empty;
    };
    let delivery_id = format!("{queue}#{delivery_number}");
    target.unacked.insert(delivery_id.clone(), message.clone());
    state.next_delivery = delivery_number;

    Next::Delivery(Delivery::new(
        delivery_id.clone(),
        message.payload,
        message.attempt,
        Box::new(InMemoryAcker {
            shared: Arc::clone(shared),
            queue: queue.to_string(),
            delivery_id,
        }),
    ))
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    delivery_id: String,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.fail_settlements {
            return Err(BrokerError::AcknowledgeFailed {
                delivery_id: self.delivery_id.clone(),
                reason: "injected settlement failure".to_string(),
            });
        }
        let message = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.delivery_id))
            .ok_or_else(|| BrokerError::AcknowledgeFailed {
                delivery_id: self.delivery_id.clone(),
                reason: "unknown delivery".to_string(),
            })?;

        match requeue {
            None => state.acked.push(self.delivery_id.clone()),
            Some(false) => state.rejected.push(self.delivery_id.clone()),
            Some(true) => {
                if let Some(queue) = state.queues.get_mut(&self.queue) {
                    queue.ready.push_back(Message {
                        payload: message.payload,
                        attempt: message.attempt + 1,
                    });
                }
                state.requeued.push(self.delivery_id.clone());
            }
        }
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

impl Acknowledger for InMemoryAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move { self.settle(None) })
    }

    fn nack(&self, requeue: bool) -> BrokerFuture<'_, ()> {
        Box::pin(async move { self.settle(Some(requeue)) })
    }
}

impl MessageBroker for InMemoryBroker {
    fn declare_queue(&self, spec: &QueueSpec) -> BrokerFuture<'_, ()> {
        let result = self.declare(spec);
        Box::pin(async move { result })
    }

    fn publish(&self, queue: &str, payload: &[u8]) -> BrokerFuture<'_, ()> {
        let result = self.push(queue, payload);
        Box::pin(async move { result })
    }

    fn consume(&self, spec: &QueueSpec) -> BrokerFuture<'_, DeliveryStream> {
        let spec = spec.clone();
        Box::pin(async move {
            {
                let state = self.shared.state.lock().unwrap();
                if state.closed {
                    return Err(BrokerError::Closed);
                }
                match state.queues.get(&spec.name) {
                    None => {
                        return Err(BrokerError::SubscriptionFailed {
                            queue: spec.name.clone(),
                            reason: "queue not declared".to_string(),
                        });
                    }
                    Some(existing) => {
                        if let Some(reason) = existing.spec.mismatch(&spec) {
                            return Err(BrokerError::QueueMismatch {
                                queue: spec.name.clone(),
                                reason,
                            });
                        }
                    }
                }
            }

            let shared = Arc::clone(&self.shared);
            let queue = spec.name;
            let stream: DeliveryStream = Box::pin(async_stream::stream! {
                loop {
                    let notified = shared.notify.notified();
                    match next_delivery(&shared, &queue) {
                        Next::Delivery(delivery) => yield Ok(delivery),
                        Next::Empty => notified.await,
                        Next::Closed => break,
                        Next::Failed(e) => {
                            yield Err(e);
                            break;
                        }
                    }
                }
            });
            Ok(stream)
        })
    }

    fn shutdown(&self) -> BrokerFuture<'_, ()> {
        self.close();
        Box::pin(async { Ok(()) })
    }
}
