//! `PostgreSQL` order store.
//!
//! Orders are deduplicated in two ways:
//!
//! - by `checkout_id`, backed by a unique constraint, for events carrying a token;
//! - by content fingerprint within a time window, for events without one.
//!
//! Both checks run under a per-user transaction-scoped advisory lock, so two
//! deliveries of the same checkout racing on different consumers serialize on the
//! check-then-insert.

use crate::{db_error, to_db_quantity, to_domain_quantity};
use cartflow_core::{
    IdempotencyKey, LineItem, NewOrder, Order, OrderCreation, OrderId, OrderStore, StoreError,
    UserId,
};
use chrono::Duration;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;

/// Default window, in minutes, in which an untokened checkout counts as a duplicate.
pub const DEFAULT_DEDUP_WINDOW_MINUTES: i64 = 10;

/// `PostgreSQL`-backed [`OrderStore`].
#[derive(Clone, Debug)]
pub struct PostgresOrderStore {
    pool: PgPool,
    dedup_window: Duration,
}

impl PostgresOrderStore {
    /// Create a store with the default fingerprint window.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            dedup_window: Duration::minutes(DEFAULT_DEDUP_WINDOW_MINUTES),
        }
    }

    /// Set the window for fingerprint deduplication.
    #[must_use]
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the order database migrations (orders and the dead-letter ledger).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations/orders")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn find_existing(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &NewOrder,
    ) -> Result<Option<OrderId>, StoreError> {
        let existing: Option<(i64,)> = match order.idempotency_key() {
            IdempotencyKey::Checkout(checkout_id) => {
                sqlx::query_as("SELECT id FROM orders WHERE checkout_id = $1")
                    .bind(checkout_id)
                    .fetch_optional(&mut **tx)
                    .await
            }
            IdempotencyKey::Fingerprint(fingerprint) => {
                sqlx::query_as(
                    r"
                    SELECT id
                    FROM orders
                    WHERE user_id = $1 AND fingerprint = $2 AND created_at >= $3
                    ORDER BY created_at DESC
                    LIMIT 1
                    ",
                )
                .bind(order.user_id.as_str())
                .bind(fingerprint)
                .bind(order.created_at - self.dedup_window)
                .fetch_optional(&mut **tx)
                .await
            }
        }
        .map_err(db_error)?;

        Ok(existing.map(|(id,)| OrderId::new(id)))
    }

    async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        order: &NewOrder,
    ) -> Result<Result<OrderId, sqlx::Error>, StoreError> {
        let inserted: Result<(i64,), sqlx::Error> = sqlx::query_as(
            r"
            INSERT INTO orders (user_id, created_at, checkout_id, fingerprint)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            ",
        )
        .bind(order.user_id.as_str())
        .bind(order.created_at)
        .bind(order.checkout_id)
        .bind(&order.fingerprint)
        .fetch_one(&mut **tx)
        .await;

        let id = match inserted {
            Ok((id,)) => id,
            Err(e) => return Ok(Err(e)),
        };

        for (position, item) in order.items.iter().enumerate() {
            let position = i32::try_from(position)
                .map_err(|_| StoreError::Serialization("Too many order items".to_string()))?;
            sqlx::query(
                r"
                INSERT INTO order_items
                    (order_id, position, product_id, product_name, quantity, unit_price)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(id)
            .bind(position)
            .bind(&item.product_id)
            .bind(&item.product_name)
            .bind(to_db_quantity(item.quantity)?)
            .bind(item.price)
            .execute(&mut **tx)
            .await
            .map_err(db_error)?;
        }

        Ok(Ok(OrderId::new(id)))
    }

    async fn items_for(
        &self,
        order_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<LineItem>>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT order_id, product_id, product_name, quantity, unit_price
            FROM order_items
            WHERE order_id = ANY($1)
            ORDER BY order_id, position ASC
            ",
        )
        .bind(order_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut items: HashMap<i64, Vec<LineItem>> = HashMap::new();
        for row in &rows {
            items
                .entry(row.get("order_id"))
                .or_default()
                .push(row_to_line_item(row)?);
        }
        Ok(items)
    }
}

impl OrderStore for PostgresOrderStore {
    async fn create_order(&self, order: NewOrder) -> Result<OrderCreation, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(order.user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        if let Some(existing) = self.find_existing(&mut tx, &order).await? {
            tracing::debug!(
                order_id = %existing,
                key = %order.idempotency_key(),
                "Order already exists"
            );
            return Ok(OrderCreation::Duplicate(existing));
        }

        let id = match Self::insert(&mut tx, &order).await? {
            Ok(id) => id,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // Same checkout token under another user's lock.
                drop(tx);
                let mut tx = self.pool.begin().await.map_err(db_error)?;
                return match self.find_existing(&mut tx, &order).await? {
                    Some(existing) => Ok(OrderCreation::Duplicate(existing)),
                    None => Err(StoreError::Database(format!(
                        "Order for {} conflicted but was not found",
                        order.idempotency_key()
                    ))),
                };
            }
            Err(e) => return Err(db_error(e)),
        };

        tx.commit().await.map_err(db_error)?;

        tracing::debug!(order_id = %id, user_id = %order.user_id, "Order inserted");
        Ok(OrderCreation::Created(order.into_order(id)))
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT id, user_id, created_at, checkout_id, fingerprint
            FROM orders
            WHERE id = $1
            ",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut items = self.items_for(&[id.get()]).await?;
        Ok(Some(row_to_order(&row, &mut items)))
    }

    async fn orders_for_user(&self, user_id: &UserId) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, user_id, created_at, checkout_id, fingerprint
            FROM orders
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            ",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|row| row.get("id")).collect();
        let mut items = self.items_for(&ids).await?;
        Ok(rows
            .iter()
            .map(|row| row_to_order(row, &mut items))
            .collect())
    }
}

fn row_to_order(row: &PgRow, items: &mut HashMap<i64, Vec<LineItem>>) -> Order {
    let id: i64 = row.get("id");
    let user_id: String = row.get("user_id");
    Order {
        id: OrderId::new(id),
        user_id: UserId::new(user_id),
        created_at: row.get("created_at"),
        checkout_id: row.get("checkout_id"),
        fingerprint: row.get("fingerprint"),
        items: items.remove(&id).unwrap_or_default(),
    }
}

fn row_to_line_item(row: &PgRow) -> Result<LineItem, StoreError> {
    let product_id: String = row.get("product_id");
    let product_name: String = row.get("product_name");
    Ok(LineItem::new(
        product_id,
        product_name,
        to_domain_quantity(row.get("quantity"))?,
        row.get("unit_price"),
    ))
}
