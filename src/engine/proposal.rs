//! Proposal negotiation engine.
//!
//! A proposal is a single buyer counter-offer on one listing, negotiated
//! through chat. `pending` is the only live state; acceptance hands off to
//! the order engine, whose listing claim is the serialization point for the
//! sale. Expiry is enforced both lazily on every read and by the sweep, so
//! no caller ever observes a pending proposal past its deadline.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::adapters::ChatBridge;
use crate::domain::{Order, Proposal, ProposalEvent, ProposalStatus};
use crate::engine::OrderEngine;
use crate::error::{HaggleError, Result};
use crate::fees::FeeCalculator;
use crate::store::MarketStore;

/// Fixed policy: a proposal stands for seven days.
pub const PROPOSAL_TTL_DAYS: i64 = 7;

pub struct ProposalEngine {
    store: Arc<dyn MarketStore>,
    chat: Arc<dyn ChatBridge>,
    orders: Arc<OrderEngine>,
    fees: FeeCalculator,
    ttl: Duration,
}

impl ProposalEngine {
    pub fn new(
        store: Arc<dyn MarketStore>,
        chat: Arc<dyn ChatBridge>,
        orders: Arc<OrderEngine>,
    ) -> Self {
        Self {
            store,
            chat,
            orders,
            fees: FeeCalculator::default(),
            ttl: Duration::days(PROPOSAL_TTL_DAYS),
        }
    }

    /// Submit an offer on a listing. Returns the stored proposal and the
    /// chat room carrying its card.
    pub async fn create(
        &self,
        listing_id: i64,
        buyer_id: i64,
        proposal_price_cents: i64,
        message: String,
    ) -> Result<(Proposal, i64)> {
        let listing = self
            .store
            .get_listing(listing_id)
            .await?
            .ok_or(HaggleError::NotFound {
                entity: "listing",
                id: listing_id,
            })?;

        if !listing.is_purchasable() {
            return Err(HaggleError::ListingUnavailable { listing_id });
        }
        if buyer_id == listing.seller_id {
            return Err(HaggleError::Validation(
                "you cannot make an offer on your own listing".to_string(),
            ));
        }
        if proposal_price_cents <= 0 {
            return Err(HaggleError::InvalidAmount(proposal_price_cents));
        }
        if proposal_price_cents >= listing.price_cents {
            return Err(HaggleError::Validation(
                "offer price must be below the asking price".to_string(),
            ));
        }

        let mut proposal = Proposal::new(
            &listing,
            buyer_id,
            proposal_price_cents,
            message,
            self.ttl,
        );
        // The partial unique index turns a concurrent duplicate into exactly
        // one winner here.
        let proposal_id = self.store.insert_proposal(&proposal).await?;
        proposal.id = Some(proposal_id);

        let room_id = self
            .chat
            .ensure_room(listing_id, buyer_id, listing.seller_id)
            .await?;

        // Shipping is unknown until an order exists; the card previews fees
        // on the offer alone.
        let preview = self.fees.quote(proposal_price_cents, 0)?;
        let event = ProposalEvent::created(&proposal, &preview);
        if let Err(e) = self
            .chat
            .append_message(room_id, buyer_id, event.kind(), event.payload())
            .await
        {
            warn!("Chat card delivery failed for proposal {}: {}", proposal_id, e);
        }

        info!(
            "Proposal {} created on listing {} by buyer {} ({} cents)",
            proposal_id, listing_id, buyer_id, proposal_price_cents
        );
        Ok((proposal, room_id))
    }

    /// Seller accepts: an order is committed at the offered price.
    ///
    /// The order engine's listing claim decides races with buy-now and with
    /// concurrent accepts; a lost claim force-expires the proposal. The
    /// proposal row itself is flipped last, conditionally, and a concurrent
    /// reject that wins in the meantime gets the fresh order compensated
    /// away (cancelled, claim released).
    pub async fn accept(&self, proposal_id: i64, actor_id: i64) -> Result<Order> {
        let proposal = self.get_enforcing_expiry(proposal_id).await?;
        if actor_id != proposal.seller_id {
            return Err(HaggleError::Forbidden(
                "only the seller may accept a proposal".to_string(),
            ));
        }
        if proposal.status != ProposalStatus::Pending {
            return Err(HaggleError::StateConflict(format!(
                "proposal {proposal_id} is {}, not pending",
                proposal.status
            )));
        }

        let order = match self.orders.create_from_proposal(&proposal).await {
            Ok(order) => order,
            Err(HaggleError::ListingUnavailable { listing_id }) => {
                // The listing sold through another channel; this offer is dead.
                self.store
                    .transition_proposal(proposal_id, ProposalStatus::Pending, ProposalStatus::Expired)
                    .await?;
                self.notify(&proposal, actor_id, ProposalEvent::Expired { proposal_id })
                    .await;
                return Err(HaggleError::ListingUnavailable { listing_id });
            }
            Err(e) => return Err(e),
        };

        if !self
            .store
            .transition_proposal(proposal_id, ProposalStatus::Pending, ProposalStatus::Accepted)
            .await?
        {
            // A concurrent reject won between our read and the claim; undo
            // the order so the proposal's terminal state stays authoritative.
            warn!(
                "Proposal {} changed state during accept; compensating order {:?}",
                proposal_id, order.id
            );
            if let Some(order_id) = order.id {
                if let Err(e) = self.orders.cancel(order_id, proposal.seller_id).await {
                    return Err(HaggleError::InvariantViolation(format!(
                        "proposal {proposal_id} left pending and order {order_id} could not be compensated: {e}"
                    )));
                }
            }
            return Err(HaggleError::StateConflict(format!(
                "proposal {proposal_id} is no longer pending"
            )));
        }

        info!(
            "Proposal {} accepted by seller {}; order {:?} created",
            proposal_id, actor_id, order.id
        );
        self.notify(
            &proposal,
            actor_id,
            ProposalEvent::Accepted {
                proposal_id,
                order_id: order.id.unwrap_or_default(),
                agreed_price_cents: proposal.proposal_price_cents,
            },
        )
        .await;
        Ok(order)
    }

    /// Seller declines the offer.
    pub async fn reject(&self, proposal_id: i64, actor_id: i64) -> Result<Proposal> {
        let proposal = self.get_enforcing_expiry(proposal_id).await?;
        if actor_id != proposal.seller_id {
            return Err(HaggleError::Forbidden(
                "only the seller may reject a proposal".to_string(),
            ));
        }
        if !self
            .store
            .transition_proposal(proposal_id, ProposalStatus::Pending, ProposalStatus::Rejected)
            .await?
        {
            return Err(HaggleError::StateConflict(format!(
                "proposal {proposal_id} is {}, not pending",
                proposal.status
            )));
        }

        info!("Proposal {} rejected by seller {}", proposal_id, actor_id);
        self.notify(&proposal, actor_id, ProposalEvent::Rejected { proposal_id })
            .await;
        self.get_enforcing_expiry(proposal_id).await
    }

    /// Fetch a proposal, lazily expiring it if its deadline passed. The
    /// conditional update means concurrent readers race harmlessly; one
    /// flips the row, the rest observe the result.
    pub async fn get(&self, proposal_id: i64) -> Result<Option<Proposal>> {
        let Some(proposal) = self.store.get_proposal(proposal_id).await? else {
            return Ok(None);
        };

        if proposal.is_expired(Utc::now()) {
            self.store
                .transition_proposal(proposal_id, ProposalStatus::Pending, ProposalStatus::Expired)
                .await?;
            return self.store.get_proposal(proposal_id).await;
        }

        Ok(Some(proposal))
    }

    /// Sweep entry point; idempotent.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        self.store.expire_stale_proposals(now).await
    }

    async fn get_enforcing_expiry(&self, proposal_id: i64) -> Result<Proposal> {
        self.get(proposal_id)
            .await?
            .ok_or(HaggleError::NotFound {
                entity: "proposal",
                id: proposal_id,
            })
    }

    /// Chat delivery is best-effort; the proposal row is the source of truth.
    async fn notify(&self, proposal: &Proposal, sender_id: i64, event: ProposalEvent) {
        let result = async {
            let room = self
                .chat
                .ensure_room(proposal.listing_id, proposal.buyer_id, proposal.seller_id)
                .await?;
            self.chat
                .append_message(room, sender_id, event.kind(), event.payload())
                .await
        }
        .await;

        if let Err(e) = result {
            warn!(
                "Chat notification failed for proposal {:?}: {}",
                proposal.id, e
            );
        }
    }
}
