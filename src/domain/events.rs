use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{MessageKind, Order, Proposal};
use crate::fees::FeeQuote;

/// Domain events emitted by the proposal engine.
///
/// Event flow is one-directional: the engines emit, the chat bridge renders.
/// The payload is what both parties' clients see on the proposal card, so it
/// carries the offer and a priced preview of the fees.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProposalEvent {
    Created {
        proposal_id: i64,
        listing_id: i64,
        buyer_id: i64,
        proposal_price_cents: i64,
        message: String,
        platform_charge_cents: i64,
        payment_provider_charge_cents: i64,
        expires_at: DateTime<Utc>,
    },
    Accepted {
        proposal_id: i64,
        order_id: i64,
        agreed_price_cents: i64,
    },
    Rejected {
        proposal_id: i64,
    },
    Expired {
        proposal_id: i64,
    },
}

impl ProposalEvent {
    pub fn created(proposal: &Proposal, preview: &FeeQuote) -> Self {
        ProposalEvent::Created {
            proposal_id: proposal.id.unwrap_or_default(),
            listing_id: proposal.listing_id,
            buyer_id: proposal.buyer_id,
            proposal_price_cents: proposal.proposal_price_cents,
            message: proposal.message.clone(),
            platform_charge_cents: preview.platform_charge_cents,
            payment_provider_charge_cents: preview.payment_provider_charge_cents,
            expires_at: proposal.expires_at,
        }
    }

    /// Proposal cards render as `proposal` messages; lifecycle announcements
    /// render as `system` messages.
    pub fn kind(&self) -> MessageKind {
        match self {
            ProposalEvent::Created { .. } => MessageKind::Proposal,
            _ => MessageKind::System,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        // The bridge reads back the latest status for a proposal card from
        // this field; keep it uniform across event shapes.
        if let Some(map) = value.as_object_mut() {
            map.insert("status".to_string(), json!(self.status_label()));
        }
        value
    }

    fn status_label(&self) -> &'static str {
        match self {
            ProposalEvent::Created { .. } => "pending",
            ProposalEvent::Accepted { .. } => "accepted",
            ProposalEvent::Rejected { .. } => "rejected",
            ProposalEvent::Expired { .. } => "expired",
        }
    }
}

/// Domain events emitted by the order engine, rendered as system messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    Created {
        order_id: i64,
        listing_id: i64,
        total_charged_cents: i64,
    },
    PaymentConfirmed {
        order_id: i64,
    },
    PaymentFailed {
        order_id: i64,
        reason: String,
    },
    ShipmentCreated {
        order_id: i64,
    },
    Shipped {
        order_id: i64,
    },
    Completed {
        order_id: i64,
        seller_credit_cents: i64,
    },
    Cancelled {
        order_id: i64,
    },
    Refunded {
        order_id: i64,
    },
}

impl OrderEvent {
    pub fn created(order: &Order) -> Self {
        OrderEvent::Created {
            order_id: order.id.unwrap_or_default(),
            listing_id: order.listing_id,
            total_charged_cents: order.total_charged_cents(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::System
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_event_payload_carries_status() {
        let payload = ProposalEvent::Rejected { proposal_id: 5 }.payload();
        assert_eq!(payload["status"], "rejected");
        assert_eq!(payload["event"], "rejected");
        assert_eq!(payload["proposal_id"], 5);
    }

    #[test]
    fn test_created_event_is_a_proposal_card() {
        let event = ProposalEvent::Created {
            proposal_id: 1,
            listing_id: 2,
            buyer_id: 3,
            proposal_price_cents: 15_000,
            message: "deal?".to_string(),
            platform_charge_cents: 750,
            payment_provider_charge_cents: 49,
            expires_at: Utc::now(),
        };
        assert_eq!(event.kind(), MessageKind::Proposal);
        assert_eq!(event.payload()["status"], "pending");
    }
}
