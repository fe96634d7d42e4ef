//! Dead-letter ledger for checkout messages.
//!
//! Messages that exhausted their delivery attempts are recorded here verbatim so
//! operators can investigate them, replay the payload, or discard it.

use crate::db_error;
use cartflow_core::{DeadLetterSink, FailedCheckout, StoreError};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

/// Status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for investigation
    Pending,
    /// Being replayed or investigated
    Processing,
    /// Replayed successfully or otherwise fixed
    Resolved,
    /// Given up on permanently
    Discarded,
}

impl DLQStatus {
    /// Database representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::Serialization(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// A ledger entry: the failed message plus its handling state.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    /// Ledger id
    pub id: i64,
    /// The failed message as recorded by the consumer
    pub checkout: FailedCheckout,
    /// When the entry was written
    pub recorded_at: DateTime<Utc>,
    /// Current status
    pub status: DLQStatus,
    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved the entry
    pub resolved_by: Option<String>,
    /// Resolution or discard notes
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL` dead-letter ledger, stored next to the orders.
///
/// # Example
///
/// ```no_run
/// use cartflow_postgres::{DeadLetterQueue, DLQStatus};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending checkouts: {}", pending.len());
///
/// dlq.update_status(pending[0].id, DLQStatus::Processing).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a ledger over the order database pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// Entries with `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT
                id, queue, delivery_id, payload, error_message, attempts, failed_at,
                recorded_at, status, resolved_at, resolved_by, resolution_notes
            FROM failed_checkouts
            WHERE status = $1
            ORDER BY failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// A single entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT
                id, queue, delivery_id, payload, error_message, attempts, failed_at,
                recorded_at, status, resolved_at, resolved_by, resolution_notes
            FROM failed_checkouts
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    /// Set an entry's status. Returns whether the entry exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE failed_checkouts SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark an entry resolved, typically after replaying its payload.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE failed_checkouts
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let found = result.rows_affected() > 0;
        if found {
            tracing::info!(dlq_id = id, resolved_by, "Dead-lettered checkout resolved");
            metrics::counter!("checkout_dead_letters_resolved_total").increment(1);
        }
        Ok(found)
    }

    /// Mark an entry permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE failed_checkouts
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let found = result.rows_affected() > 0;
        if found {
            tracing::warn!(dlq_id = id, reason, "Dead-lettered checkout discarded");
            metrics::counter!("checkout_dead_letters_discarded_total").increment(1);
        }
        Ok(found)
    }

    /// Number of pending entries, for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_checkouts WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;

        Ok(count)
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, StoreError> {
        let status: String = row.get("status");
        let attempts: i32 = row.get("attempts");
        let attempts = u32::try_from(attempts)
            .map_err(|_| StoreError::Serialization(format!("Invalid attempt count: {attempts}")))?;

        Ok(DeadLetterEntry {
            id: row.get("id"),
            checkout: FailedCheckout {
                queue: row.get("queue"),
                delivery_id: row.get("delivery_id"),
                payload: row.get("payload"),
                error_message: row.get("error_message"),
                attempts,
                failed_at: row.get("failed_at"),
            },
            recorded_at: row.get("recorded_at"),
            status: DLQStatus::parse(&status)?,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    async fn record(&self, failed: FailedCheckout) -> Result<i64, StoreError> {
        let attempts = i32::try_from(failed.attempts).unwrap_or(i32::MAX);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_checkouts (
                queue, delivery_id, payload, error_message, attempts, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(&failed.queue)
        .bind(&failed.delivery_id)
        .bind(&failed.payload)
        .bind(&failed.error_message)
        .bind(attempts)
        .bind(failed.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        tracing::warn!(
            dlq_id = id,
            queue = %failed.queue,
            delivery_id = %failed.delivery_id,
            attempts = failed.attempts,
            error = %failed.error_message,
            "Checkout added to dead-letter ledger"
        );

        Ok(id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn dlq_status_roundtrip() {
        for status in &[
            DLQStatus::Pending,
            DLQStatus::Processing,
            DLQStatus::Resolved,
            DLQStatus::Discarded,
        ] {
            let parsed = DLQStatus::parse(status.as_str()).expect("valid status should parse");
            assert_eq!(*status, parsed);
        }
    }

    #[test]
    fn dlq_status_invalid() {
        assert!(matches!(
            DLQStatus::parse("archived"),
            Err(StoreError::Serialization(_))
        ));
    }
}
