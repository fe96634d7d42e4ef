//! In-memory dead-letter ledger.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use cartflow_core::{DeadLetterSink, FailedCheckout, StoreError};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct LedgerState {
    entries: Vec<FailedCheckout>,
    fail: bool,
}

/// Vec-backed [`DeadLetterSink`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryDeadLetterQueue {
    /// Create a new empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded entries in insertion order
    #[must_use]
    pub fn entries(&self) -> Vec<FailedCheckout> {
        self.state.read().unwrap().entries.clone()
    }

    /// Number of recorded entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().entries.len()
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every `record` fail
    pub fn fail_writes(&self, fail: bool) {
        self.state.write().unwrap().fail = fail;
    }
}

impl DeadLetterSink for InMemoryDeadLetterQueue {
    async fn record(&self, failed: FailedCheckout) -> Result<i64, StoreError> {
        let mut state = self.state.write().unwrap();
        if state.fail {
            return Err(StoreError::Database("injected dead-letter failure".to_string()));
        }
        state.entries.push(failed);
        Ok(i64::try_from(state.entries.len()).unwrap_or(i64::MAX))
    }
}
