//! Transactional data access for the rows this core owns.
//!
//! Every status change goes through a conditional compare-and-set on the
//! expected current status; exactly one concurrent writer wins and losers
//! observe `false`. The listing row is the serialization point for
//! availability, so transitions that claim or release a listing are a single
//! store call (one transaction in the Postgres implementation).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Listing, Order, OrderStatus, Proposal, ProposalStatus};
use crate::error::Result;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait MarketStore: Send + Sync {
    // ==================== Listings ====================

    async fn get_listing(&self, listing_id: i64) -> Result<Option<Listing>>;

    /// Claim the listing for an order: `available -> reserved`.
    /// Returns false when the claim race was lost.
    async fn reserve_listing(&self, listing_id: i64) -> Result<bool>;

    /// Release a claim after a failed or abandoned order: `reserved -> available`.
    async fn release_listing(&self, listing_id: i64) -> Result<bool>;

    // ==================== Users ====================

    /// The user's active address, if any.
    async fn active_address_id(&self, user_id: i64) -> Result<Option<i64>>;

    /// The user's payment-processor connected account, if onboarded.
    async fn connected_account(&self, user_id: i64) -> Result<Option<String>>;

    async fn set_connected_account(&self, user_id: i64, account_id: &str) -> Result<()>;

    // ==================== Proposals ====================

    /// Insert a pending proposal. Fails with `DuplicateProposal` when the
    /// buyer already has a pending proposal on the listing (enforced by a
    /// partial unique index, so two concurrent creates cannot both land).
    async fn insert_proposal(&self, proposal: &Proposal) -> Result<i64>;

    async fn get_proposal(&self, proposal_id: i64) -> Result<Option<Proposal>>;

    /// Conditional transition; returns false when the row was not in `from`.
    async fn transition_proposal(
        &self,
        proposal_id: i64,
        from: ProposalStatus,
        to: ProposalStatus,
    ) -> Result<bool>;

    /// Bulk expiry: every pending proposal past its `expires_at` becomes
    /// `expired`. Idempotent; safe under concurrent sweeps.
    async fn expire_stale_proposals(&self, now: DateTime<Utc>) -> Result<u64>;

    // ==================== Orders ====================

    async fn insert_order(&self, order: &Order) -> Result<i64>;

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>>;

    /// Conditional transition between non-terminal states.
    async fn transition_order(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool>;

    /// Replace the settlement reference after a payment retry.
    async fn set_payment_transaction(&self, order_id: i64, transaction_id: &str) -> Result<()>;

    /// Atomically move the order to `completed` (from `from`) and the listing
    /// to `sold`. One transaction; returns false when the order race was lost.
    async fn complete_order(&self, order_id: i64, from: OrderStatus, listing_id: i64)
        -> Result<bool>;

    /// Atomically move the order to a terminal failure state (`cancelled`,
    /// `expired` or `payment_refunded`) and release the listing claim.
    async fn terminate_order(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
        listing_id: i64,
    ) -> Result<bool>;

    /// Bulk expiry of payment-window overruns: `payment_pending` orders
    /// created before `cutoff` become `expired` and their listing claims are
    /// released. Idempotent.
    async fn expire_stale_orders(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
