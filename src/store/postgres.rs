use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::domain::{Listing, ListingStatus, Order, OrderSource, OrderStatus, Proposal, ProposalStatus};
use crate::error::{HaggleError, Result};
use crate::store::MarketStore;

/// Partial unique index backing the one-pending-proposal-per-buyer rule.
const PENDING_PROPOSAL_CONSTRAINT: &str = "proposals_one_pending_per_buyer";

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool (zero-cost reuse)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn listing_from_row(row: &PgRow) -> Result<Listing> {
        let status: String = row.get("status");
        Ok(Listing {
            id: row.get("id"),
            seller_id: row.get("seller_id"),
            title: row.get("title"),
            price_cents: row.get("price_cents"),
            easy_pay: row.get("easy_pay"),
            published: row.get("published"),
            status: ListingStatus::try_from(status.as_str()).map_err(HaggleError::Internal)?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn proposal_from_row(row: &PgRow) -> Result<Proposal> {
        let status: String = row.get("status");
        Ok(Proposal {
            id: Some(row.get("id")),
            listing_id: row.get("listing_id"),
            buyer_id: row.get("buyer_id"),
            seller_id: row.get("seller_id"),
            proposal_price_cents: row.get("proposal_price_cents"),
            message: row.get("message"),
            status: ProposalStatus::try_from(status.as_str()).map_err(HaggleError::Internal)?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            expires_at: row.get("expires_at"),
        })
    }

    fn order_from_row(row: &PgRow) -> Result<Order> {
        let status: String = row.get("status");
        let source: String = row.get("source");
        Ok(Order {
            id: Some(row.get("id")),
            listing_id: row.get("listing_id"),
            buyer_id: row.get("buyer_id"),
            seller_id: row.get("seller_id"),
            buyer_address_id: row.get("buyer_address_id"),
            seller_address_id: row.get("seller_address_id"),
            source: OrderSource::try_from(source.as_str()).map_err(HaggleError::Internal)?,
            proposal_id: row.try_get("proposal_id").ok(),
            original_price_cents: row.get("original_price_cents"),
            agreed_price_cents: row.get("agreed_price_cents"),
            shipping_price_cents: row.get("shipping_price_cents"),
            platform_charge_cents: row.get("platform_charge_cents"),
            payment_provider_charge_cents: row.get("payment_provider_charge_cents"),
            fee_calculator_version: row.get("fee_calculator_version"),
            payment_transaction_id: row.try_get("payment_transaction_id").ok(),
            status: OrderStatus::try_from(status.as_str()).map_err(HaggleError::Internal)?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl MarketStore for PostgresStore {
    // ==================== Listings ====================

    async fn get_listing(&self, listing_id: i64) -> Result<Option<Listing>> {
        let row = sqlx::query(
            r#"
            SELECT id, seller_id, title, price_cents, easy_pay, published, status,
                   created_at, updated_at
            FROM listings WHERE id = $1
            "#,
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::listing_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn reserve_listing(&self, listing_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE listings SET status = 'reserved', updated_at = NOW()
            WHERE id = $1 AND status = 'available'
            "#,
        )
        .bind(listing_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release_listing(&self, listing_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE listings SET status = 'available', updated_at = NOW()
            WHERE id = $1 AND status = 'reserved'
            "#,
        )
        .bind(listing_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ==================== Users ====================

    async fn active_address_id(&self, user_id: i64) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM addresses
            WHERE user_id = $1 AND active = TRUE
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("id")))
    }

    async fn connected_account(&self, user_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT connected_account_id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|r| r.try_get("connected_account_id").ok()))
    }

    async fn set_connected_account(&self, user_id: i64, account_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users SET connected_account_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Proposals ====================

    #[instrument(skip(self, proposal))]
    async fn insert_proposal(&self, proposal: &Proposal) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO proposals
                (listing_id, buyer_id, seller_id, proposal_price_cents, message,
                 status, created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(proposal.listing_id)
        .bind(proposal.buyer_id)
        .bind(proposal.seller_id)
        .bind(proposal.proposal_price_cents)
        .bind(&proposal.message)
        .bind(proposal.status.as_str())
        .bind(proposal.created_at)
        .bind(proposal.updated_at)
        .bind(proposal.expires_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.get("id")),
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some(PENDING_PROPOSAL_CONSTRAINT) =>
            {
                Err(HaggleError::DuplicateProposal {
                    listing_id: proposal.listing_id,
                    buyer_id: proposal.buyer_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_proposal(&self, proposal_id: i64) -> Result<Option<Proposal>> {
        let row = sqlx::query(
            r#"
            SELECT id, listing_id, buyer_id, seller_id, proposal_price_cents, message,
                   status, created_at, updated_at, expires_at
            FROM proposals WHERE id = $1
            "#,
        )
        .bind(proposal_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::proposal_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn transition_proposal(
        &self,
        proposal_id: i64,
        from: ProposalStatus,
        to: ProposalStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE proposals SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(proposal_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn expire_stale_proposals(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE proposals SET status = 'expired', updated_at = NOW()
            WHERE status = 'pending' AND expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let expired = result.rows_affected();
        if expired > 0 {
            info!("Expired {} stale proposals", expired);
        }
        Ok(expired)
    }

    // ==================== Orders ====================

    #[instrument(skip(self, order))]
    async fn insert_order(&self, order: &Order) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO orders
                (listing_id, buyer_id, seller_id, buyer_address_id, seller_address_id,
                 source, proposal_id, original_price_cents, agreed_price_cents,
                 shipping_price_cents, platform_charge_cents, payment_provider_charge_cents,
                 fee_calculator_version, payment_transaction_id, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING id
            "#,
        )
        .bind(order.listing_id)
        .bind(order.buyer_id)
        .bind(order.seller_id)
        .bind(order.buyer_address_id)
        .bind(order.seller_address_id)
        .bind(order.source.as_str())
        .bind(order.proposal_id)
        .bind(order.original_price_cents)
        .bind(order.agreed_price_cents)
        .bind(order.shipping_price_cents)
        .bind(order.platform_charge_cents)
        .bind(order.payment_provider_charge_cents)
        .bind(&order.fee_calculator_version)
        .bind(order.payment_transaction_id.as_deref())
        .bind(order.status.as_str())
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, listing_id, buyer_id, seller_id, buyer_address_id, seller_address_id,
                   source, proposal_id, original_price_cents, agreed_price_cents,
                   shipping_price_cents, platform_charge_cents, payment_provider_charge_cents,
                   fee_calculator_version, payment_transaction_id, status, created_at, updated_at
            FROM orders WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::order_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn transition_order(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(order_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_payment_transaction(&self, order_id: i64, transaction_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders SET payment_transaction_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_order(
        &self,
        order_id: i64,
        from: OrderStatus,
        listing_id: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let order_updated = sqlx::query(
            r#"
            UPDATE orders SET status = 'completed', updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(order_id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if order_updated != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        let listing_updated = sqlx::query(
            r#"
            UPDATE listings SET status = 'sold', updated_at = NOW()
            WHERE id = $1 AND status = 'reserved'
            "#,
        )
        .bind(listing_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if listing_updated != 1 {
            tx.rollback().await?;
            return Err(HaggleError::InvariantViolation(format!(
                "order {order_id} completed but listing {listing_id} was not reserved"
            )));
        }

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn terminate_order(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
        listing_id: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let order_updated = sqlx::query(
            r#"
            UPDATE orders SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(order_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if order_updated != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        let released = sqlx::query(
            r#"
            UPDATE listings SET status = 'available', updated_at = NOW()
            WHERE id = $1 AND status = 'reserved'
            "#,
        )
        .bind(listing_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if released == 0 {
            debug!(
                "Listing {} was not reserved while terminating order {}",
                listing_id, order_id
            );
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn expire_stale_orders(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            UPDATE orders SET status = 'expired', updated_at = NOW()
            WHERE status = 'payment_pending' AND created_at < $1
            RETURNING listing_id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let listing_ids: Vec<i64> = rows.iter().map(|r| r.get("listing_id")).collect();

        if !listing_ids.is_empty() {
            sqlx::query(
                r#"
                UPDATE listings SET status = 'available', updated_at = NOW()
                WHERE id = ANY($1) AND status = 'reserved'
                "#,
            )
            .bind(&listing_ids)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let expired = listing_ids.len() as u64;
        if expired > 0 {
            info!("Expired {} stale orders past the payment window", expired);
        }
        Ok(expired)
    }
}
