//! End-to-end negotiation and settlement flow over the in-process backends.

use chrono::Utc;
use haggle::adapters::{
    ChatBridge, FlatRateEstimator, GatewayCall, MemoryChatBridge, SimulatedGateway,
};
use haggle::domain::{Listing, ListingStatus, OrderStatus, ProposalStatus};
use haggle::engine::{OrderEngine, PaymentPolicy, ProposalEngine};
use haggle::error::HaggleError;
use haggle::store::{MarketStore, MemoryStore};
use std::sync::Arc;

const SELLER: i64 = 10;
const BUYER: i64 = 3;
const OTHER_BUYER: i64 = 4;

struct World {
    store: Arc<MemoryStore>,
    chat: Arc<MemoryChatBridge>,
    gateway: Arc<SimulatedGateway>,
    orders: Arc<OrderEngine>,
    proposals: ProposalEngine,
}

fn world() -> World {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let chat = Arc::new(MemoryChatBridge::new());
    let gateway = Arc::new(SimulatedGateway::new());
    let orders = Arc::new(OrderEngine::new(
        store.clone(),
        gateway.clone(),
        Arc::new(FlatRateEstimator::new(800)),
        chat.clone(),
        PaymentPolicy::default(),
    ));
    let proposals = ProposalEngine::new(store.clone(), chat.clone(), orders.clone());

    store.put_listing(Listing {
        id: 1,
        seller_id: SELLER,
        title: "record player".to_string(),
        price_cents: 20_000,
        easy_pay: true,
        published: true,
        status: ListingStatus::Available,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    });
    store.put_active_address(BUYER, 20);
    store.put_active_address(OTHER_BUYER, 21);
    store.put_active_address(SELLER, 30);
    store.put_connected_account(SELLER, "acct_seller");

    World {
        store,
        chat,
        gateway,
        orders,
        proposals,
    }
}

#[tokio::test]
async fn negotiated_sale_settles_end_to_end() {
    let w = world();

    // Buyer offers 150.00 against the 200.00 asking price
    let (proposal, room_id) = w
        .proposals
        .create(1, BUYER, 15_000, "150 and it's a deal".to_string())
        .await
        .unwrap();
    let proposal_id = proposal.id.unwrap();

    // The card is visible to both parties as pending
    assert_eq!(
        w.chat.latest_proposal_status(room_id, proposal_id).await.unwrap(),
        Some(ProposalStatus::Pending)
    );

    // Seller accepts; the order snapshots the negotiated economics:
    // platform 5% of 150.00 = 7.50; provider 0.25% of 165.50 + 0.10 = 0.51
    let order = w.proposals.accept(proposal_id, SELLER).await.unwrap();
    let order_id = order.id.unwrap();
    assert_eq!(order.agreed_price_cents, 15_000);
    assert_eq!(order.shipping_price_cents, 800);
    assert_eq!(order.platform_charge_cents, 750);
    assert_eq!(order.payment_provider_charge_cents, 51);
    assert_eq!(order.total_charged_cents(), 16_601);

    // The full total was authorized on the buyer's instrument
    let intent_amount = w
        .gateway
        .calls()
        .into_iter()
        .find_map(|c| match c {
            GatewayCall::PaymentIntent { amount_cents, .. } => Some(amount_cents),
            _ => None,
        })
        .unwrap();
    assert_eq!(intent_amount, 16_601);

    // The chat card now renders as accepted
    assert_eq!(
        w.chat.latest_proposal_status(room_id, proposal_id).await.unwrap(),
        Some(ProposalStatus::Accepted)
    );

    // Payment capture, shipment, handover
    w.orders.confirm_payment(order_id).await.unwrap();
    w.orders.shipment_created(order_id).await.unwrap();
    w.orders.mark_shipped(order_id, SELLER).await.unwrap();

    // Buyer confirms receipt; seller is credited item + shipping - fees
    let completed = w.orders.release(order_id, BUYER).await.unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);

    let transfer_amount = w
        .gateway
        .calls()
        .into_iter()
        .find_map(|c| match c {
            GatewayCall::Transfer { amount_cents, .. } => Some(amount_cents),
            _ => None,
        })
        .unwrap();
    assert_eq!(transfer_amount, 15_800 - 750 - 51);

    // Nothing created or destroyed across the settlement
    assert_eq!(
        completed.total_charged_cents() - completed.seller_credit_cents(),
        2 * (completed.platform_charge_cents + completed.payment_provider_charge_cents)
    );

    let listing = w.store.get_listing(1).await.unwrap().unwrap();
    assert_eq!(listing.status, ListingStatus::Sold);
}

#[tokio::test]
async fn second_pending_offer_from_same_buyer_is_rejected() {
    let w = world();

    w.proposals.create(1, BUYER, 15_000, String::new()).await.unwrap();
    let err = w
        .proposals
        .create(1, BUYER, 16_000, String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HaggleError::DuplicateProposal { .. }));

    // Another buyer can still negotiate in parallel
    w.proposals
        .create(1, OTHER_BUYER, 14_000, String::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_buyers_cannot_both_win_the_listing() {
    let w = world();

    let (a, b) = tokio::join!(
        w.orders.create_from_buy_now(1, BUYER),
        w.orders.create_from_buy_now(1, OTHER_BUYER),
    );

    let oks = [a.is_ok(), b.is_ok()].iter().filter(|&&ok| ok).count();
    assert_eq!(oks, 1);
    let loser = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(loser, HaggleError::ListingUnavailable { .. }));
}

#[tokio::test]
async fn accepted_proposal_loses_to_earlier_buy_now() {
    let w = world();

    let (proposal, _) = w.proposals.create(1, BUYER, 15_000, String::new()).await.unwrap();
    w.orders.create_from_buy_now(1, OTHER_BUYER).await.unwrap();

    let err = w.proposals.accept(proposal.id.unwrap(), SELLER).await.unwrap_err();
    assert!(matches!(err, HaggleError::ListingUnavailable { .. }));

    // The dead offer was force-expired, terminally
    let stored = w.proposals.get(proposal.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(stored.status, ProposalStatus::Expired);
    let err = w.proposals.accept(proposal.id.unwrap(), SELLER).await.unwrap_err();
    assert!(matches!(err, HaggleError::StateConflict(_)));
}

#[tokio::test]
async fn terminal_states_never_move() {
    let w = world();

    let (proposal, _) = w.proposals.create(1, BUYER, 15_000, String::new()).await.unwrap();
    let proposal_id = proposal.id.unwrap();
    w.proposals.reject(proposal_id, SELLER).await.unwrap();

    let err = w.proposals.accept(proposal_id, SELLER).await.unwrap_err();
    assert!(matches!(err, HaggleError::StateConflict(_)));

    let order = w.orders.create_from_buy_now(1, BUYER).await.unwrap();
    let order_id = order.id.unwrap();
    w.orders.cancel(order_id, BUYER).await.unwrap();

    for attempt in [
        w.orders.confirm_payment(order_id).await,
        w.orders.release(order_id, BUYER).await,
        w.orders.cancel(order_id, BUYER).await,
    ] {
        assert!(matches!(attempt.unwrap_err(), HaggleError::StateConflict(_)));
    }
}

#[tokio::test]
async fn cancelled_sale_reopens_the_listing() {
    let w = world();

    let order = w.orders.create_from_buy_now(1, BUYER).await.unwrap();
    assert_eq!(
        w.store.get_listing(1).await.unwrap().unwrap().status,
        ListingStatus::Reserved
    );

    w.orders.cancel(order.id.unwrap(), SELLER).await.unwrap();
    assert_eq!(
        w.store.get_listing(1).await.unwrap().unwrap().status,
        ListingStatus::Available
    );

    // A new sale can start immediately
    w.orders.create_from_buy_now(1, OTHER_BUYER).await.unwrap();
}
