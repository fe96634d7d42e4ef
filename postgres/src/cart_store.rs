//! `PostgreSQL` cart store.
//!
//! Carts live in `carts` (one row per user, carrying the version) and their lines
//! in `cart_items`. A save rewrites every line of the cart inside one transaction
//! guarded by the version, so readers never observe a half-written cart.

use crate::{db_error, to_db_quantity, to_domain_quantity};
use cartflow_core::{Cart, CartItem, CartStore, StoreError, UserId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

/// `PostgreSQL`-backed [`CartStore`].
///
/// # Example
///
/// ```no_run
/// use cartflow_postgres::PostgresCartStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = sqlx::PgPool::connect("postgres://localhost/carts").await?;
/// let store = PostgresCartStore::new(pool);
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresCartStore {
    pool: PgPool,
}

impl PostgresCartStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and create a store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self::new(pool))
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the cart database migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations/carts")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn load_items(
        tx: &mut Transaction<'_, Postgres>,
        user_id: &UserId,
    ) -> Result<Vec<CartItem>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT product_id, product_name, quantity, unit_price
            FROM cart_items
            WHERE user_id = $1
            ORDER BY position ASC
            ",
        )
        .bind(user_id.as_str())
        .fetch_all(&mut **tx)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_item).collect()
    }

    async fn current_version(
        tx: &mut Transaction<'_, Postgres>,
        user_id: &UserId,
    ) -> Result<i64, StoreError> {
        let version: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM carts WHERE user_id = $1")
                .bind(user_id.as_str())
                .fetch_optional(&mut **tx)
                .await
                .map_err(db_error)?;
        Ok(version.map_or(0, |(v,)| v))
    }
}

impl CartStore for PostgresCartStore {
    async fn load(&self, user_id: &UserId) -> Result<Option<Cart>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Share lock keeps a concurrent save from rewriting items between the reads.
        let version: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM carts WHERE user_id = $1 FOR SHARE")
                .bind(user_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?;

        let Some((version,)) = version else {
            return Ok(None);
        };
        let items = Self::load_items(&mut tx, user_id).await?;
        tx.commit().await.map_err(db_error)?;

        tracing::debug!(user_id = %user_id, version, items = items.len(), "Cart loaded");
        Ok(Some(Cart::from_parts(user_id.clone(), items, version)))
    }

    async fn load_or_create(&self, user_id: &UserId) -> Result<Cart, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // The no-op update locks an existing row so it cannot be deleted or
        // rewritten before the items are read.
        let row = sqlx::query(
            r"
            INSERT INTO carts (user_id, version)
            VALUES ($1, 1)
            ON CONFLICT (user_id) DO UPDATE SET version = carts.version
            RETURNING version, (xmax = 0) AS created
            ",
        )
        .bind(user_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        let version: i64 = row.get("version");
        let created: bool = row.get("created");

        let items = if created {
            Vec::new()
        } else {
            Self::load_items(&mut tx, user_id).await?
        };
        tx.commit().await.map_err(db_error)?;

        if created {
            tracing::info!(user_id = %user_id, "Cart created");
        }
        Ok(Cart::from_parts(user_id.clone(), items, version))
    }

    async fn save(&self, cart: &Cart) -> Result<Cart, StoreError> {
        let user_id = cart.user_id();
        let expected = cart.version();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let rows_affected = if expected == 0 {
            sqlx::query(
                r"
                INSERT INTO carts (user_id, version)
                VALUES ($1, 1)
                ON CONFLICT (user_id) DO NOTHING
                ",
            )
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected()
        } else {
            sqlx::query(
                r"
                UPDATE carts
                SET version = version + 1, updated_at = NOW()
                WHERE user_id = $1 AND version = $2
                ",
            )
            .bind(user_id.as_str())
            .bind(expected)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected()
        };

        if rows_affected == 0 {
            let actual = Self::current_version(&mut tx, user_id).await?;
            tracing::debug!(user_id = %user_id, expected, actual, "Cart version conflict");
            return Err(StoreError::Conflict {
                user_id: user_id.to_string(),
                expected,
                actual,
            });
        }

        sqlx::query("DELETE FROM cart_items WHERE user_id = $1")
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        for (position, item) in cart.items().iter().enumerate() {
            let position = i32::try_from(position)
                .map_err(|_| StoreError::Serialization("Too many cart items".to_string()))?;
            sqlx::query(
                r"
                INSERT INTO cart_items
                    (user_id, position, product_id, product_name, quantity, unit_price)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(user_id.as_str())
            .bind(position)
            .bind(item.product_id())
            .bind(item.product_name())
            .bind(to_db_quantity(item.quantity())?)
            .bind(item.unit_price())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;

        let version = expected + 1;
        tracing::debug!(user_id = %user_id, version, items = cart.items().len(), "Cart saved");
        Ok(cart.clone().with_version(version))
    }

    async fn delete(&self, cart: &Cart) -> Result<bool, StoreError> {
        let user_id = cart.user_id();
        let expected = cart.version();
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let rows_affected = sqlx::query("DELETE FROM carts WHERE user_id = $1 AND version = $2")
            .bind(user_id.as_str())
            .bind(expected)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?
            .rows_affected();

        if rows_affected == 0 {
            let actual = Self::current_version(&mut tx, user_id).await?;
            if actual == 0 {
                tracing::debug!(user_id = %user_id, "No cart to delete");
                return Ok(false);
            }
            tracing::debug!(user_id = %user_id, expected, actual, "Cart version conflict on delete");
            return Err(StoreError::Conflict {
                user_id: user_id.to_string(),
                expected,
                actual,
            });
        }

        tx.commit().await.map_err(db_error)?;
        tracing::debug!(user_id = %user_id, version = expected, "Cart deleted");
        Ok(true)
    }
}

fn row_to_item(row: &PgRow) -> Result<CartItem, StoreError> {
    let product_id: String = row.get("product_id");
    let quantity = to_domain_quantity(row.get("quantity"))?;

    CartItem::from_stored(
        product_id.clone(),
        row.get("product_name"),
        quantity,
        row.get("unit_price"),
    )
    .ok_or_else(|| StoreError::Serialization(format!("Cart item '{product_id}' has no units")))
}
