//! In-process store with the same conditional-update semantics as the
//! Postgres implementation. Backs dry-run mode and the test suite; every
//! compare-and-set happens under one mutex so concurrent callers observe the
//! same single-winner behavior as the SQL `WHERE status = ...` guards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::{Listing, ListingStatus, Order, OrderStatus, Proposal, ProposalStatus};
use crate::error::{HaggleError, Result};
use crate::store::MarketStore;

#[derive(Default)]
struct Inner {
    listings: HashMap<i64, Listing>,
    proposals: HashMap<i64, Proposal>,
    orders: HashMap<i64, Order>,
    /// user_id -> active address id
    addresses: HashMap<i64, i64>,
    /// user_id -> connected account id
    accounts: HashMap<i64, String>,
    next_proposal_id: i64,
    next_order_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers for dry-run sessions and tests. Listings, addresses
    // and accounts are owned by the wider marketplace, not this core, so
    // they have no engine-facing write path.

    pub fn put_listing(&self, listing: Listing) {
        self.inner.lock().unwrap().listings.insert(listing.id, listing);
    }

    pub fn put_active_address(&self, user_id: i64, address_id: i64) {
        self.inner.lock().unwrap().addresses.insert(user_id, address_id);
    }

    pub fn put_connected_account(&self, user_id: i64, account_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .accounts
            .insert(user_id, account_id.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    // ==================== Listings ====================

    async fn get_listing(&self, listing_id: i64) -> Result<Option<Listing>> {
        Ok(self.lock().listings.get(&listing_id).cloned())
    }

    async fn reserve_listing(&self, listing_id: i64) -> Result<bool> {
        let mut inner = self.lock();
        match inner.listings.get_mut(&listing_id) {
            Some(listing) if listing.status == ListingStatus::Available => {
                listing.status = ListingStatus::Reserved;
                listing.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_listing(&self, listing_id: i64) -> Result<bool> {
        let mut inner = self.lock();
        match inner.listings.get_mut(&listing_id) {
            Some(listing) if listing.status == ListingStatus::Reserved => {
                listing.status = ListingStatus::Available;
                listing.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ==================== Users ====================

    async fn active_address_id(&self, user_id: i64) -> Result<Option<i64>> {
        Ok(self.lock().addresses.get(&user_id).copied())
    }

    async fn connected_account(&self, user_id: i64) -> Result<Option<String>> {
        Ok(self.lock().accounts.get(&user_id).cloned())
    }

    async fn set_connected_account(&self, user_id: i64, account_id: &str) -> Result<()> {
        self.lock().accounts.insert(user_id, account_id.to_string());
        Ok(())
    }

    // ==================== Proposals ====================

    async fn insert_proposal(&self, proposal: &Proposal) -> Result<i64> {
        let mut inner = self.lock();

        let duplicate = inner.proposals.values().any(|p| {
            p.listing_id == proposal.listing_id
                && p.buyer_id == proposal.buyer_id
                && p.status == ProposalStatus::Pending
        });
        if duplicate {
            return Err(HaggleError::DuplicateProposal {
                listing_id: proposal.listing_id,
                buyer_id: proposal.buyer_id,
            });
        }

        inner.next_proposal_id += 1;
        let id = inner.next_proposal_id;
        let mut stored = proposal.clone();
        stored.id = Some(id);
        inner.proposals.insert(id, stored);
        Ok(id)
    }

    async fn get_proposal(&self, proposal_id: i64) -> Result<Option<Proposal>> {
        Ok(self.lock().proposals.get(&proposal_id).cloned())
    }

    async fn transition_proposal(
        &self,
        proposal_id: i64,
        from: ProposalStatus,
        to: ProposalStatus,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.proposals.get_mut(&proposal_id) {
            Some(proposal) if proposal.status == from => {
                proposal.status = to;
                proposal.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_stale_proposals(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let mut expired = 0;
        for proposal in inner.proposals.values_mut() {
            if proposal.status == ProposalStatus::Pending && proposal.expires_at < now {
                proposal.status = ProposalStatus::Expired;
                proposal.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    // ==================== Orders ====================

    async fn insert_order(&self, order: &Order) -> Result<i64> {
        let mut inner = self.lock();
        inner.next_order_id += 1;
        let id = inner.next_order_id;
        let mut stored = order.clone();
        stored.id = Some(id);
        inner.orders.insert(id, stored);
        Ok(id)
    }

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>> {
        Ok(self.lock().orders.get(&order_id).cloned())
    }

    async fn transition_order(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.orders.get_mut(&order_id) {
            Some(order) if order.status == from => {
                order.status = to;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_payment_transaction(&self, order_id: i64, transaction_id: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(order) = inner.orders.get_mut(&order_id) {
            order.payment_transaction_id = Some(transaction_id.to_string());
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete_order(
        &self,
        order_id: i64,
        from: OrderStatus,
        listing_id: i64,
    ) -> Result<bool> {
        let mut inner = self.lock();

        let won = match inner.orders.get_mut(&order_id) {
            Some(order) if order.status == from => {
                order.status = OrderStatus::Completed;
                order.updated_at = Utc::now();
                true
            }
            _ => false,
        };
        if !won {
            return Ok(false);
        }

        match inner.listings.get_mut(&listing_id) {
            Some(listing) if listing.status == ListingStatus::Reserved => {
                listing.status = ListingStatus::Sold;
                listing.updated_at = Utc::now();
                Ok(true)
            }
            _ => {
                // Mirror the Postgres rollback: the completion stands or
                // falls with the listing write.
                if let Some(order) = inner.orders.get_mut(&order_id) {
                    order.status = from;
                }
                Err(HaggleError::InvariantViolation(format!(
                    "order {order_id} completed but listing {listing_id} was not reserved"
                )))
            }
        }
    }

    async fn terminate_order(
        &self,
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
        listing_id: i64,
    ) -> Result<bool> {
        let mut inner = self.lock();

        let won = match inner.orders.get_mut(&order_id) {
            Some(order) if order.status == from => {
                order.status = to;
                order.updated_at = Utc::now();
                true
            }
            _ => false,
        };
        if !won {
            return Ok(false);
        }

        if let Some(listing) = inner.listings.get_mut(&listing_id) {
            if listing.status == ListingStatus::Reserved {
                listing.status = ListingStatus::Available;
                listing.updated_at = Utc::now();
            }
        }
        Ok(true)
    }

    async fn expire_stale_orders(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let stale: Vec<(i64, i64)> = inner
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::PaymentPending && o.created_at < cutoff)
            .map(|o| (o.id.unwrap_or_default(), o.listing_id))
            .collect();

        for (order_id, listing_id) in &stale {
            if let Some(order) = inner.orders.get_mut(order_id) {
                order.status = OrderStatus::Expired;
                order.updated_at = Utc::now();
            }
            if let Some(listing) = inner.listings.get_mut(listing_id) {
                if listing.status == ListingStatus::Reserved {
                    listing.status = ListingStatus::Available;
                    listing.updated_at = Utc::now();
                }
            }
        }
        Ok(stale.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn listing(id: i64) -> Listing {
        Listing {
            id,
            seller_id: 10,
            title: "camera".to_string(),
            price_cents: 20_000,
            easy_pay: true,
            published: true,
            status: ListingStatus::Available,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn pending_proposal(listing: &Listing, buyer_id: i64) -> Proposal {
        Proposal::new(listing, buyer_id, 15_000, String::new(), Duration::days(7))
    }

    #[tokio::test]
    async fn test_reserve_is_single_winner() {
        let store = MemoryStore::new();
        store.put_listing(listing(1));

        assert!(store.reserve_listing(1).await.unwrap());
        assert!(!store.reserve_listing(1).await.unwrap());
        assert!(store.release_listing(1).await.unwrap());
        assert!(store.reserve_listing(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_pending_proposal_rejected() {
        let store = MemoryStore::new();
        let l = listing(1);
        store.put_listing(l.clone());

        store.insert_proposal(&pending_proposal(&l, 3)).await.unwrap();
        let err = store.insert_proposal(&pending_proposal(&l, 3)).await.unwrap_err();
        assert!(matches!(err, HaggleError::DuplicateProposal { .. }));

        // A different buyer is fine
        store.insert_proposal(&pending_proposal(&l, 4)).await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let store = MemoryStore::new();
        let l = listing(1);
        store.put_listing(l.clone());
        let id = store.insert_proposal(&pending_proposal(&l, 3)).await.unwrap();

        assert!(store
            .transition_proposal(id, ProposalStatus::Pending, ProposalStatus::Rejected)
            .await
            .unwrap());
        // Second writer loses; terminal state never moves
        assert!(!store
            .transition_proposal(id, ProposalStatus::Pending, ProposalStatus::Accepted)
            .await
            .unwrap());
        assert_eq!(
            store.get_proposal(id).await.unwrap().unwrap().status,
            ProposalStatus::Rejected
        );
    }

    #[tokio::test]
    async fn test_expire_stale_proposals_idempotent() {
        let store = MemoryStore::new();
        let l = listing(1);
        store.put_listing(l.clone());
        let mut proposal = pending_proposal(&l, 3);
        proposal.expires_at = Utc::now() - Duration::days(1);
        store.insert_proposal(&proposal).await.unwrap();

        let now = Utc::now();
        assert_eq!(store.expire_stale_proposals(now).await.unwrap(), 1);
        assert_eq!(store.expire_stale_proposals(now).await.unwrap(), 0);
    }
}
