//! Dead-letter sink for checkout messages that exhausted their redelivery budget.

use crate::store::StoreError;
use chrono::{DateTime, Utc};
use std::future::Future;

/// A checkout message that could not be turned into an order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedCheckout {
    /// Queue the message came from
    pub queue: String,
    /// Broker delivery identifier of the final attempt
    pub delivery_id: String,
    /// Raw message body, kept verbatim for replay
    pub payload: Vec<u8>,
    /// Last processing error
    pub error_message: String,
    /// Number of delivery attempts made
    pub attempts: u32,
    /// When the message was given up on
    pub failed_at: DateTime<Utc>,
}

/// Durable ledger of failed checkouts.
pub trait DeadLetterSink: Send + Sync {
    /// Records a failed checkout and returns its ledger id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the entry could not be written. Callers must not
    /// drop the message in that case.
    fn record(&self, failed: FailedCheckout)
    -> impl Future<Output = Result<i64, StoreError>> + Send;
}
