//! Order lifecycle engine.
//!
//! Creation is effectively transactional: fees are computed, the listing is
//! claimed, the payment intent is created, and only on gateway success is
//! the order row persisted. A failure anywhere before persistence releases
//! the listing claim and leaves no partial state behind.
//!
//! All dependencies are injected; there are no ambient singletons.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::{
    ChatBridge, PaymentIntentRequest, SettlementGateway, ShipmentEstimator, TransferRequest,
};
use crate::domain::{Listing, ListingStatus, Order, OrderEvent, OrderSource, OrderStatus, Proposal};
use crate::error::{HaggleError, Result};
use crate::fees::FeeCalculator;
use crate::store::MarketStore;

/// Payment policy knobs, from configuration.
#[derive(Debug, Clone)]
pub struct PaymentPolicy {
    /// ISO currency code passed to the settlement gateway
    pub currency: String,
    /// How long a `payment_pending` order may wait for capture
    pub payment_window: Duration,
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self {
            currency: "eur".to_string(),
            payment_window: Duration::days(2),
        }
    }
}

pub struct OrderEngine {
    store: Arc<dyn MarketStore>,
    settlement: Arc<dyn SettlementGateway>,
    shipping: Arc<dyn ShipmentEstimator>,
    chat: Arc<dyn ChatBridge>,
    fees: FeeCalculator,
    policy: PaymentPolicy,
}

impl OrderEngine {
    pub fn new(
        store: Arc<dyn MarketStore>,
        settlement: Arc<dyn SettlementGateway>,
        shipping: Arc<dyn ShipmentEstimator>,
        chat: Arc<dyn ChatBridge>,
        policy: PaymentPolicy,
    ) -> Self {
        Self {
            store,
            settlement,
            shipping,
            chat,
            fees: FeeCalculator::default(),
            policy,
        }
    }

    // ==================== Creation ====================

    /// Commit a sale at the asking price.
    pub async fn create_from_buy_now(&self, listing_id: i64, buyer_id: i64) -> Result<Order> {
        let listing = self.require_listing(listing_id).await?;
        self.create_order(&listing, buyer_id, OrderSource::BuyNow, None)
            .await
    }

    /// Commit a sale at an accepted proposal's price.
    pub async fn create_from_proposal(&self, proposal: &Proposal) -> Result<Order> {
        let listing = self.require_listing(proposal.listing_id).await?;
        self.create_order(
            &listing,
            proposal.buyer_id,
            OrderSource::AcceptedProposal,
            Some(proposal),
        )
        .await
    }

    async fn create_order(
        &self,
        listing: &Listing,
        buyer_id: i64,
        source: OrderSource,
        proposal: Option<&Proposal>,
    ) -> Result<Order> {
        if !listing.published || !listing.easy_pay {
            return Err(HaggleError::Validation(
                "listing is not eligible for easy-pay checkout".to_string(),
            ));
        }
        if buyer_id == listing.seller_id {
            return Err(HaggleError::Validation(
                "you cannot buy your own listing".to_string(),
            ));
        }
        if listing.status != ListingStatus::Available {
            return Err(HaggleError::ListingUnavailable {
                listing_id: listing.id,
            });
        }

        let buyer_address_id = self
            .store
            .active_address_id(buyer_id)
            .await?
            .ok_or(HaggleError::AddressRequired { user_id: buyer_id })?;
        let seller_address_id = self
            .store
            .active_address_id(listing.seller_id)
            .await?
            .ok_or(HaggleError::AddressRequired {
                user_id: listing.seller_id,
            })?;
        let destination_account = self
            .store
            .connected_account(listing.seller_id)
            .await?
            .ok_or_else(|| {
                HaggleError::Validation("seller is not onboarded for payouts".to_string())
            })?;

        let agreed_price_cents = proposal
            .map(|p| p.proposal_price_cents)
            .unwrap_or(listing.price_cents);

        // Shipping is fetched once, here; the snapshot is immutable afterwards.
        let shipping = self.shipping.estimate(listing.id, buyer_address_id).await?;
        let quote = self.fees.quote(agreed_price_cents, shipping.amount_cents)?;

        let mut order = Order::new(
            listing.id,
            buyer_id,
            listing.seller_id,
            buyer_address_id,
            seller_address_id,
            source,
            proposal,
            listing.price_cents,
            &quote,
        );

        if order.total_charged_cents() != quote.total_cents() {
            return Err(HaggleError::InvariantViolation(format!(
                "order snapshot total {} != quoted total {}",
                order.total_charged_cents(),
                quote.total_cents()
            )));
        }
        order.check_settlement_invariant()?;

        // Serialization point: exactly one in-flight order per listing.
        if !self.store.reserve_listing(listing.id).await? {
            return Err(HaggleError::ListingUnavailable {
                listing_id: listing.id,
            });
        }

        // Creation has no order id yet, so the idempotency key is derived
        // from what commits the sale: the proposal, or (listing, buyer).
        let idempotency_key = match proposal.and_then(|p| p.id) {
            Some(proposal_id) => format!("proposal-{proposal_id}-order"),
            None => format!("listing-{}-buyer-{}-buy-now", listing.id, buyer_id),
        };

        let request = PaymentIntentRequest {
            amount_cents: quote.total_cents(),
            currency: self.policy.currency.clone(),
            destination_account_id: destination_account,
            application_fee_cents: quote.platform_charge_cents
                + quote.payment_provider_charge_cents,
            idempotency_key,
            metadata: json!({
                "listing_id": listing.id,
                "buyer_id": buyer_id,
                "source": source.as_str(),
            }),
        };

        let intent = match self.settlement.create_payment_intent(&request).await {
            Ok(intent) => intent,
            Err(e) => {
                self.release_claim(listing.id).await;
                warn!("Payment intent creation failed for listing {}: {}", listing.id, e);
                return Err(HaggleError::PaymentIntentFailed(e.to_string()));
            }
        };
        order.payment_transaction_id = Some(intent.intent_id);

        let order_id = match self.store.insert_order(&order).await {
            Ok(id) => id,
            Err(e) => {
                self.release_claim(listing.id).await;
                return Err(e);
            }
        };
        order.id = Some(order_id);

        info!(
            "Created order {} on listing {} ({}, {} cents total)",
            order_id,
            listing.id,
            source,
            order.total_charged_cents()
        );
        self.notify(&order, buyer_id, OrderEvent::created(&order)).await;
        Ok(order)
    }

    // ==================== Payment ====================

    /// Settlement webhook/poll entry: the buyer's charge was captured.
    pub async fn confirm_payment(&self, order_id: i64) -> Result<Order> {
        let order = self.require_order(order_id).await?;
        if !self
            .store
            .transition_order(order_id, OrderStatus::PaymentPending, OrderStatus::PaymentConfirmed)
            .await?
        {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} is {}, not payment_pending",
                order.status
            )));
        }

        info!("Payment confirmed for order {}", order_id);
        self.notify(&order, order.buyer_id, OrderEvent::PaymentConfirmed { order_id })
            .await;
        self.require_order(order_id).await
    }

    /// Settlement webhook entry: the charge attempt failed.
    pub async fn fail_payment(&self, order_id: i64, reason: &str) -> Result<Order> {
        let order = self.require_order(order_id).await?;
        if !self
            .store
            .transition_order(order_id, OrderStatus::PaymentPending, OrderStatus::PaymentFailed)
            .await?
        {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} is {}, not payment_pending",
                order.status
            )));
        }

        warn!("Payment failed for order {}: {}", order_id, reason);
        self.notify(
            &order,
            order.buyer_id,
            OrderEvent::PaymentFailed {
                order_id,
                reason: reason.to_string(),
            },
        )
        .await;
        self.require_order(order_id).await
    }

    /// Buyer retry after a failed charge: fresh intent, back to pending.
    pub async fn retry_payment(&self, order_id: i64, actor_id: i64) -> Result<Order> {
        let order = self.require_order(order_id).await?;
        if actor_id != order.buyer_id {
            return Err(HaggleError::Forbidden(
                "only the buyer may retry payment".to_string(),
            ));
        }
        if order.status != OrderStatus::PaymentFailed {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} is {}, not payment_failed",
                order.status
            )));
        }

        let destination_account = self
            .store
            .connected_account(order.seller_id)
            .await?
            .ok_or_else(|| {
                HaggleError::InvariantViolation(format!(
                    "seller {} lost their connected account after order {} was created",
                    order.seller_id, order_id
                ))
            })?;

        // A fresh key: the previous intent is dead and must not be replayed.
        let request = PaymentIntentRequest {
            amount_cents: order.total_charged_cents(),
            currency: self.policy.currency.clone(),
            destination_account_id: destination_account,
            application_fee_cents: order.platform_charge_cents
                + order.payment_provider_charge_cents,
            idempotency_key: format!("order-{order_id}-retry-{}", Uuid::new_v4()),
            metadata: json!({ "order_id": order_id, "retry": true }),
        };
        let intent = self
            .settlement
            .create_payment_intent(&request)
            .await
            .map_err(|e| HaggleError::PaymentIntentFailed(e.to_string()))?;

        self.store
            .set_payment_transaction(order_id, &intent.intent_id)
            .await?;
        if !self
            .store
            .transition_order(order_id, OrderStatus::PaymentFailed, OrderStatus::PaymentPending)
            .await?
        {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} left payment_failed while retrying"
            )));
        }

        info!("Payment retry issued for order {}", order_id);
        self.require_order(order_id).await
    }

    // ==================== Shipping ====================

    /// Shipment-flow callback: a shipment now exists for the order.
    pub async fn shipment_created(&self, order_id: i64) -> Result<Order> {
        let order = self.require_order(order_id).await?;
        if !self
            .store
            .transition_order(order_id, OrderStatus::PaymentConfirmed, OrderStatus::ShippingPending)
            .await?
        {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} is {}, not payment_confirmed",
                order.status
            )));
        }

        self.notify(&order, order.seller_id, OrderEvent::ShipmentCreated { order_id })
            .await;
        self.require_order(order_id).await
    }

    /// Seller handed the parcel to the carrier.
    pub async fn mark_shipped(&self, order_id: i64, actor_id: i64) -> Result<Order> {
        let order = self.require_order(order_id).await?;
        if actor_id != order.seller_id {
            return Err(HaggleError::Forbidden(
                "only the seller may confirm shipment".to_string(),
            ));
        }
        if !self
            .store
            .transition_order(order_id, OrderStatus::ShippingPending, OrderStatus::ShippingConfirmed)
            .await?
        {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} is {}, not shipping_pending",
                order.status
            )));
        }

        self.notify(&order, order.seller_id, OrderEvent::Shipped { order_id })
            .await;
        self.require_order(order_id).await
    }

    // ==================== Completion ====================

    /// Buyer confirms receipt: transfer the seller credit and complete.
    ///
    /// The transfer carries an order-scoped idempotency key, so if the
    /// completion write below loses a race after the transfer succeeded, a
    /// retry re-delivers the same transfer instead of paying twice.
    pub async fn release(&self, order_id: i64, actor_id: i64) -> Result<Order> {
        let order = self.require_order(order_id).await?;
        if actor_id != order.buyer_id {
            return Err(HaggleError::Forbidden(
                "only the buyer may release funds".to_string(),
            ));
        }
        if !order.status.is_releasable() {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} is {}, not releasable",
                order.status
            )));
        }

        if let Err(e) = order.check_settlement_invariant() {
            error!("Refusing to release order {}: {}", order_id, e);
            return Err(e);
        }

        let destination_account = self
            .store
            .connected_account(order.seller_id)
            .await?
            .ok_or_else(|| {
                HaggleError::InvariantViolation(format!(
                    "seller {} has no connected account at release of order {}",
                    order.seller_id, order_id
                ))
            })?;

        let receipt = self
            .settlement
            .transfer(&TransferRequest {
                amount_cents: order.seller_credit_cents(),
                currency: self.policy.currency.clone(),
                destination_account_id: destination_account,
                idempotency_key: format!("order-{order_id}-release"),
            })
            .await?;

        if !self
            .store
            .complete_order(order_id, order.status, order.listing_id)
            .await?
        {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} left {} during release",
                order.status
            )));
        }

        info!(
            "Released order {}: transferred {} cents to seller {} ({})",
            order_id,
            order.seller_credit_cents(),
            order.seller_id,
            receipt.transfer_id
        );
        self.notify(
            &order,
            order.buyer_id,
            OrderEvent::Completed {
                order_id,
                seller_credit_cents: order.seller_credit_cents(),
            },
        )
        .await;
        self.require_order(order_id).await
    }

    /// Post-charge dispute or cancellation: refund the intent.
    pub async fn refund(&self, order_id: i64, actor_id: i64) -> Result<Order> {
        let order = self.require_order(order_id).await?;
        if actor_id != order.buyer_id && actor_id != order.seller_id {
            return Err(HaggleError::Forbidden(
                "only a party to the order may request a refund".to_string(),
            ));
        }
        if order.status != OrderStatus::PaymentConfirmed {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} is {}, not payment_confirmed",
                order.status
            )));
        }

        let intent_id = order.payment_transaction_id.clone().ok_or_else(|| {
            HaggleError::InvariantViolation(format!(
                "order {order_id} is payment_confirmed without a payment transaction"
            ))
        })?;

        self.settlement
            .refund(&intent_id, &format!("order-{order_id}-refund"))
            .await?;

        if !self
            .store
            .terminate_order(
                order_id,
                OrderStatus::PaymentConfirmed,
                OrderStatus::PaymentRefunded,
                order.listing_id,
            )
            .await?
        {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} left payment_confirmed during refund"
            )));
        }

        info!("Refunded order {}", order_id);
        self.notify(&order, actor_id, OrderEvent::Refunded { order_id })
            .await;
        self.require_order(order_id).await
    }

    /// Either party may cancel before capture; funds never moved.
    pub async fn cancel(&self, order_id: i64, actor_id: i64) -> Result<Order> {
        let order = self.require_order(order_id).await?;
        if actor_id != order.buyer_id && actor_id != order.seller_id {
            return Err(HaggleError::Forbidden(
                "only a party to the order may cancel it".to_string(),
            ));
        }
        if !order.status.is_cancellable() {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} is {}, too late to cancel",
                order.status
            )));
        }

        if !self
            .store
            .terminate_order(order_id, order.status, OrderStatus::Cancelled, order.listing_id)
            .await?
        {
            return Err(HaggleError::StateConflict(format!(
                "order {order_id} left {} during cancel",
                order.status
            )));
        }

        info!("Cancelled order {}", order_id);
        self.notify(&order, actor_id, OrderEvent::Cancelled { order_id })
            .await;
        self.require_order(order_id).await
    }

    // ==================== Expiry & reads ====================

    /// Sweep payment-window overruns. Idempotent; safe to run concurrently
    /// with lazy expiry on reads.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        self.store
            .expire_stale_orders(now - self.policy.payment_window)
            .await
    }

    /// Fetch an order, lazily expiring a stale `payment_pending` row so no
    /// reader ever observes one past the payment window.
    pub async fn get(&self, order_id: i64) -> Result<Option<Order>> {
        let Some(order) = self.store.get_order(order_id).await? else {
            return Ok(None);
        };

        if order.status == OrderStatus::PaymentPending
            && order.created_at + self.policy.payment_window < Utc::now()
        {
            self.store
                .terminate_order(
                    order_id,
                    OrderStatus::PaymentPending,
                    OrderStatus::Expired,
                    order.listing_id,
                )
                .await?;
            return self.store.get_order(order_id).await;
        }

        Ok(Some(order))
    }

    // ==================== Onboarding ====================

    /// Create (or return) the seller's connected account at the processor.
    pub async fn onboard_seller(&self, seller_id: i64, email: &str, country: &str) -> Result<String> {
        if let Some(existing) = self.store.connected_account(seller_id).await? {
            return Ok(existing);
        }

        let account = self
            .settlement
            .create_connected_account(email, country, json!({ "user_id": seller_id }))
            .await?;
        self.store
            .set_connected_account(seller_id, &account.account_id)
            .await?;

        info!("Onboarded seller {} as {}", seller_id, account.account_id);
        Ok(account.account_id)
    }

    // ==================== Helpers ====================

    async fn require_listing(&self, listing_id: i64) -> Result<Listing> {
        self.store
            .get_listing(listing_id)
            .await?
            .ok_or(HaggleError::NotFound {
                entity: "listing",
                id: listing_id,
            })
    }

    async fn require_order(&self, order_id: i64) -> Result<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(HaggleError::NotFound {
                entity: "order",
                id: order_id,
            })
    }

    async fn release_claim(&self, listing_id: i64) {
        if let Err(e) = self.store.release_listing(listing_id).await {
            error!("Failed to release listing {} claim: {}", listing_id, e);
        }
    }

    /// Chat delivery is best-effort; the order row is the source of truth.
    async fn notify(&self, order: &Order, sender_id: i64, event: OrderEvent) {
        let result = async {
            let room = self
                .chat
                .ensure_room(order.listing_id, order.buyer_id, order.seller_id)
                .await?;
            self.chat
                .append_message(room, sender_id, event.kind(), event.payload())
                .await
        }
        .await;

        if let Err(e) = result {
            warn!(
                "Chat notification failed for order {:?}: {}",
                order.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::shipping::MockShipmentEstimator;
    use crate::adapters::{FlatRateEstimator, GatewayCall, MemoryChatBridge, SimulatedGateway};
    use crate::store::MemoryStore;

    const SELLER: i64 = 10;
    const BUYER: i64 = 3;

    fn listing(id: i64, price_cents: i64) -> Listing {
        Listing {
            id,
            seller_id: SELLER,
            title: "turntable".to_string(),
            price_cents,
            easy_pay: true,
            published: true,
            status: ListingStatus::Available,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        gateway: Arc<SimulatedGateway>,
        engine: OrderEngine,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(SimulatedGateway::new());
        let engine = OrderEngine::new(
            store.clone(),
            gateway.clone(),
            Arc::new(FlatRateEstimator::new(800)),
            Arc::new(MemoryChatBridge::new()),
            PaymentPolicy::default(),
        );
        Harness { store, gateway, engine }
    }

    fn seed_parties(store: &MemoryStore) {
        store.put_active_address(BUYER, 20);
        store.put_active_address(SELLER, 30);
        store.put_connected_account(SELLER, "acct_seller");
    }

    #[tokio::test]
    async fn test_buy_now_snapshot_and_intent() {
        let h = harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));

        let order = h.engine.create_from_buy_now(1, BUYER).await.unwrap();
        assert_eq!(order.agreed_price_cents, 20_000);
        assert_eq!(order.shipping_price_cents, 800);
        // 200.00 sits on the 100-200 boundary and pays 5%
        assert_eq!(order.platform_charge_cents, 1_000);
        // collected 218.00 -> 0.25% = 0.545 -> 0.55, + 0.10 = 0.65
        assert_eq!(order.payment_provider_charge_cents, 65);
        assert_eq!(order.status, OrderStatus::PaymentPending);
        assert!(order.payment_transaction_id.is_some());

        // The intent was asked for exactly the buyer-charged total
        match &h.gateway.calls()[0] {
            GatewayCall::PaymentIntent { amount_cents, destination, .. } => {
                assert_eq!(*amount_cents, order.total_charged_cents());
                assert_eq!(destination, "acct_seller");
            }
            other => panic!("unexpected call {other:?}"),
        }

        // Listing is claimed
        let l = h.store.get_listing(1).await.unwrap().unwrap();
        assert_eq!(l.status, ListingStatus::Reserved);
    }

    #[tokio::test]
    async fn test_buy_now_requires_address() {
        let h = harness();
        h.store.put_listing(listing(1, 20_000));
        h.store.put_active_address(SELLER, 30);
        h.store.put_connected_account(SELLER, "acct_seller");

        let err = h.engine.create_from_buy_now(1, BUYER).await.unwrap_err();
        assert!(matches!(err, HaggleError::AddressRequired { user_id } if user_id == BUYER));
    }

    #[tokio::test]
    async fn test_buy_now_requires_onboarded_seller() {
        let h = harness();
        h.store.put_listing(listing(1, 20_000));
        h.store.put_active_address(BUYER, 20);
        h.store.put_active_address(SELLER, 30);

        let err = h.engine.create_from_buy_now(1, BUYER).await.unwrap_err();
        assert!(matches!(err, HaggleError::Validation(_)));
    }

    #[tokio::test]
    async fn test_shipping_outage_aborts_creation() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        seed_parties(&store);
        store.put_listing(listing(1, 20_000));

        let mut estimator = MockShipmentEstimator::new();
        estimator.expect_estimate().returning(|_, _| {
            Err(HaggleError::ShippingUnavailable("courier API returned 503".to_string()))
        });

        let engine = OrderEngine::new(
            store.clone(),
            Arc::new(SimulatedGateway::new()),
            Arc::new(estimator),
            Arc::new(MemoryChatBridge::new()),
            PaymentPolicy::default(),
        );

        let err = engine.create_from_buy_now(1, BUYER).await.unwrap_err();
        assert!(matches!(err, HaggleError::ShippingUnavailable(_)));

        // The estimate runs before the claim, so the listing stays open
        let l = store.get_listing(1).await.unwrap().unwrap();
        assert_eq!(l.status, ListingStatus::Available);
    }

    #[tokio::test]
    async fn test_gateway_failure_releases_claim() {
        let h = harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));
        h.gateway.fail_next();

        let err = h.engine.create_from_buy_now(1, BUYER).await.unwrap_err();
        assert!(matches!(err, HaggleError::PaymentIntentFailed(_)));

        // No partial order, and the listing is purchasable again
        let l = h.store.get_listing(1).await.unwrap().unwrap();
        assert_eq!(l.status, ListingStatus::Available);
        h.engine.create_from_buy_now(1, BUYER).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_buy_now_single_winner() {
        let h = harness();
        seed_parties(&h.store);
        h.store.put_active_address(4, 21);
        h.store.put_listing(listing(1, 20_000));

        let (a, b) = tokio::join!(
            h.engine.create_from_buy_now(1, BUYER),
            h.engine.create_from_buy_now(1, 4),
        );
        let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        let loser = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
        assert!(matches!(loser, HaggleError::ListingUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_full_release_flow() {
        let h = harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));

        let order = h.engine.create_from_buy_now(1, BUYER).await.unwrap();
        let id = order.id.unwrap();

        h.engine.confirm_payment(id).await.unwrap();
        h.engine.shipment_created(id).await.unwrap();
        h.engine.mark_shipped(id, SELLER).await.unwrap();

        let released = h.engine.release(id, BUYER).await.unwrap();
        assert_eq!(released.status, OrderStatus::Completed);

        let l = h.store.get_listing(1).await.unwrap().unwrap();
        assert_eq!(l.status, ListingStatus::Sold);

        let transfer = h
            .gateway
            .calls()
            .into_iter()
            .find_map(|c| match c {
                GatewayCall::Transfer { amount_cents, .. } => Some(amount_cents),
                _ => None,
            })
            .unwrap();
        assert_eq!(transfer, order.seller_credit_cents());
    }

    #[tokio::test]
    async fn test_release_requires_buyer() {
        let h = harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));

        let order = h.engine.create_from_buy_now(1, BUYER).await.unwrap();
        let id = order.id.unwrap();
        h.engine.confirm_payment(id).await.unwrap();

        let err = h.engine.release(id, SELLER).await.unwrap_err();
        assert!(matches!(err, HaggleError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_release_blocked_before_capture() {
        let h = harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));

        let order = h.engine.create_from_buy_now(1, BUYER).await.unwrap();
        let err = h.engine.release(order.id.unwrap(), BUYER).await.unwrap_err();
        assert!(matches!(err, HaggleError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_transfer_failure_leaves_order_untouched() {
        let h = harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));

        let order = h.engine.create_from_buy_now(1, BUYER).await.unwrap();
        let id = order.id.unwrap();
        h.engine.confirm_payment(id).await.unwrap();

        h.gateway.fail_next();
        let err = h.engine.release(id, BUYER).await.unwrap_err();
        assert!(err.is_retryable());

        let current = h.engine.get(id).await.unwrap().unwrap();
        assert_eq!(current.status, OrderStatus::PaymentConfirmed);

        // Retry succeeds and completes
        let released = h.engine.release(id, BUYER).await.unwrap();
        assert_eq!(released.status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_before_capture_releases_listing() {
        let h = harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));

        let order = h.engine.create_from_buy_now(1, BUYER).await.unwrap();
        let id = order.id.unwrap();

        let cancelled = h.engine.cancel(id, SELLER).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        let l = h.store.get_listing(1).await.unwrap().unwrap();
        assert_eq!(l.status, ListingStatus::Available);

        // Terminal: no further transitions
        let err = h.engine.confirm_payment(id).await.unwrap_err();
        assert!(matches!(err, HaggleError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_refund_after_capture() {
        let h = harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));

        let order = h.engine.create_from_buy_now(1, BUYER).await.unwrap();
        let id = order.id.unwrap();
        h.engine.confirm_payment(id).await.unwrap();

        let refunded = h.engine.refund(id, BUYER).await.unwrap();
        assert_eq!(refunded.status, OrderStatus::PaymentRefunded);
        let l = h.store.get_listing(1).await.unwrap().unwrap();
        assert_eq!(l.status, ListingStatus::Available);
    }

    #[tokio::test]
    async fn test_payment_failed_retry_loop() {
        let h = harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));

        let order = h.engine.create_from_buy_now(1, BUYER).await.unwrap();
        let id = order.id.unwrap();
        let first_intent = order.payment_transaction_id.clone().unwrap();

        h.engine.fail_payment(id, "card declined").await.unwrap();
        let retried = h.engine.retry_payment(id, BUYER).await.unwrap();
        assert_eq!(retried.status, OrderStatus::PaymentPending);
        assert_ne!(retried.payment_transaction_id.unwrap(), first_intent);
    }

    /// Engine with a zero payment window: every pending order is already
    /// past its deadline, which is what expiry paths want to see.
    fn zero_window_harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(SimulatedGateway::new());
        let engine = OrderEngine::new(
            store.clone(),
            gateway.clone(),
            Arc::new(FlatRateEstimator::new(800)),
            Arc::new(MemoryChatBridge::new()),
            PaymentPolicy {
                currency: "eur".to_string(),
                payment_window: Duration::zero(),
            },
        );
        Harness { store, gateway, engine }
    }

    #[tokio::test]
    async fn test_lazy_expiry_on_read() {
        let h = zero_window_harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));

        let order = h.engine.create_from_buy_now(1, BUYER).await.unwrap();
        let id = order.id.unwrap();

        // A plain read flips the stale pending order and frees the listing
        let current = h.engine.get(id).await.unwrap().unwrap();
        assert_eq!(current.status, OrderStatus::Expired);
        let l = h.store.get_listing(1).await.unwrap().unwrap();
        assert_eq!(l.status, ListingStatus::Available);
    }

    #[tokio::test]
    async fn test_sweep_expiry_idempotent() {
        let h = zero_window_harness();
        seed_parties(&h.store);
        h.store.put_listing(listing(1, 20_000));

        let order = h.engine.create_from_buy_now(1, BUYER).await.unwrap();

        assert_eq!(h.engine.expire_stale(Utc::now()).await.unwrap(), 1);
        assert_eq!(h.engine.expire_stale(Utc::now()).await.unwrap(), 0);

        let current = h.engine.get(order.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(current.status, OrderStatus::Expired);
        let l = h.store.get_listing(1).await.unwrap().unwrap();
        assert_eq!(l.status, ListingStatus::Available);
    }

    #[tokio::test]
    async fn test_onboard_seller_is_idempotent() {
        let h = harness();
        let first = h.engine.onboard_seller(SELLER, "s@example.com", "DE").await.unwrap();
        let second = h.engine.onboard_seller(SELLER, "s@example.com", "DE").await.unwrap();
        assert_eq!(first, second);
        // Only one account was created at the gateway
        let creations = h
            .gateway
            .calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::ConnectedAccount { .. }))
            .count();
        assert_eq!(creations, 1);
    }
}
