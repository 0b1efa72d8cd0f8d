use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HaggleError, Result};
use crate::fees::FeeQuote;

use super::Proposal;

/// Order status.
///
/// ```text
/// payment_pending -> payment_confirmed -> shipping_pending -> shipping_confirmed -> completed
/// payment_pending -> payment_failed -> (retry -> payment_pending | cancelled)
/// payment_confirmed -> payment_refunded
/// payment_pending -> cancelled | expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PaymentPending,
    PaymentConfirmed,
    PaymentFailed,
    ShippingPending,
    ShippingConfirmed,
    Completed,
    Cancelled,
    Expired,
    PaymentRefunded,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::PaymentRefunded
        )
    }

    /// States from which the buyer may confirm receipt and release funds.
    pub fn is_releasable(&self) -> bool {
        matches!(
            self,
            OrderStatus::PaymentConfirmed
                | OrderStatus::ShippingPending
                | OrderStatus::ShippingConfirmed
        )
    }

    /// States from which either party may cancel before capture.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, OrderStatus::PaymentPending | OrderStatus::PaymentFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PaymentPending => "payment_pending",
            OrderStatus::PaymentConfirmed => "payment_confirmed",
            OrderStatus::PaymentFailed => "payment_failed",
            OrderStatus::ShippingPending => "shipping_pending",
            OrderStatus::ShippingConfirmed => "shipping_confirmed",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::PaymentRefunded => "payment_refunded",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = String;

    fn try_from(raw: &str) -> std::result::Result<Self, Self::Error> {
        match raw {
            "payment_pending" => Ok(OrderStatus::PaymentPending),
            "payment_confirmed" => Ok(OrderStatus::PaymentConfirmed),
            "payment_failed" => Ok(OrderStatus::PaymentFailed),
            "shipping_pending" => Ok(OrderStatus::ShippingPending),
            "shipping_confirmed" => Ok(OrderStatus::ShippingConfirmed),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "expired" => Ok(OrderStatus::Expired),
            "payment_refunded" => Ok(OrderStatus::PaymentRefunded),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// How the sale was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSource {
    BuyNow,
    AcceptedProposal,
}

impl OrderSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSource::BuyNow => "buy_now",
            OrderSource::AcceptedProposal => "accepted_proposal",
        }
    }
}

impl std::fmt::Display for OrderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderSource {
    type Error = String;

    fn try_from(raw: &str) -> std::result::Result<Self, Self::Error> {
        match raw {
            "buy_now" => Ok(OrderSource::BuyNow),
            "accepted_proposal" => Ok(OrderSource::AcceptedProposal),
            other => Err(format!("unknown order source: {other}")),
        }
    }
}

/// A committed sale (from buy-now or an accepted proposal) tracked through
/// payment and shipment to completion.
///
/// Prices and charges are an immutable snapshot taken at creation; the fee
/// calculator version is persisted alongside so historical orders stay
/// auditable if the formula changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Option<i64>,
    pub listing_id: i64,
    pub buyer_id: i64,
    pub seller_id: i64,
    pub buyer_address_id: i64,
    pub seller_address_id: i64,
    pub source: OrderSource,
    /// Set iff `source == AcceptedProposal`; a weak back-reference, the order
    /// does not own the proposal's lifecycle.
    pub proposal_id: Option<i64>,
    /// Listing price at order creation time
    pub original_price_cents: i64,
    /// Listing price, or the accepted proposal price
    pub agreed_price_cents: i64,
    pub shipping_price_cents: i64,
    pub platform_charge_cents: i64,
    pub payment_provider_charge_cents: i64,
    pub fee_calculator_version: String,
    /// External settlement reference (payment intent id)
    pub payment_transaction_id: Option<String>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        listing_id: i64,
        buyer_id: i64,
        seller_id: i64,
        buyer_address_id: i64,
        seller_address_id: i64,
        source: OrderSource,
        proposal: Option<&Proposal>,
        original_price_cents: i64,
        quote: &FeeQuote,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            listing_id,
            buyer_id,
            seller_id,
            buyer_address_id,
            seller_address_id,
            source,
            proposal_id: proposal.and_then(|p| p.id),
            original_price_cents,
            agreed_price_cents: quote.item_price_cents,
            shipping_price_cents: quote.shipping_price_cents,
            platform_charge_cents: quote.platform_charge_cents,
            payment_provider_charge_cents: quote.payment_provider_charge_cents,
            fee_calculator_version: quote.calculator_version.to_string(),
            payment_transaction_id: None,
            status: OrderStatus::PaymentPending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Amount authorized on the buyer's payment instrument.
    pub fn total_charged_cents(&self) -> i64 {
        self.agreed_price_cents
            + self.shipping_price_cents
            + self.platform_charge_cents
            + self.payment_provider_charge_cents
    }

    /// Amount transferred to the seller's connected account at release.
    pub fn seller_credit_cents(&self) -> i64 {
        self.agreed_price_cents + self.shipping_price_cents
            - self.platform_charge_cents
            - self.payment_provider_charge_cents
    }

    /// No value created or destroyed: what the buyer is charged must equal
    /// the seller credit plus what the platform and processor retain. The
    /// buyer pays the fee snapshot on top and the seller payout is docked by
    /// the same snapshot, so the retained share is exactly twice it.
    pub fn check_settlement_invariant(&self) -> Result<()> {
        let retained = self.total_charged_cents() - self.seller_credit_cents();
        let expected = 2 * (self.platform_charge_cents + self.payment_provider_charge_cents);
        if retained != expected {
            return Err(HaggleError::InvariantViolation(format!(
                "order {:?}: retained {} != 2 * fee snapshot {}",
                self.id, retained, expected
            )));
        }
        if self.seller_credit_cents() <= 0 {
            return Err(HaggleError::InvariantViolation(format!(
                "order {:?}: non-positive seller credit {}",
                self.id,
                self.seller_credit_cents()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FeeCalculator;

    fn test_order(agreed: i64, shipping: i64) -> Order {
        let quote = FeeCalculator::default().quote(agreed, shipping).unwrap();
        Order::new(1, 2, 3, 20, 30, OrderSource::BuyNow, None, agreed, &quote)
    }

    #[test]
    fn test_terminal_states() {
        for status in [
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Expired,
            OrderStatus::PaymentRefunded,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_releasable());
        }
        for status in [
            OrderStatus::PaymentPending,
            OrderStatus::PaymentConfirmed,
            OrderStatus::PaymentFailed,
            OrderStatus::ShippingPending,
            OrderStatus::ShippingConfirmed,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_releasable_states() {
        assert!(OrderStatus::PaymentConfirmed.is_releasable());
        assert!(OrderStatus::ShippingPending.is_releasable());
        assert!(OrderStatus::ShippingConfirmed.is_releasable());
        assert!(!OrderStatus::PaymentPending.is_releasable());
        assert!(!OrderStatus::PaymentFailed.is_releasable());
    }

    #[test]
    fn test_totals() {
        // 150.00 item + 8.00 shipping -> 7.50 platform + 0.51 provider
        let order = test_order(15_000, 800);
        assert_eq!(order.total_charged_cents(), 16_601);
        assert_eq!(order.seller_credit_cents(), 14_999);
        order.check_settlement_invariant().unwrap();
    }

    #[test]
    fn test_invariant_rejects_fees_exceeding_credit() {
        let mut order = test_order(15_000, 800);
        order.platform_charge_cents = 20_000;
        assert!(order.check_settlement_invariant().is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            OrderStatus::PaymentPending,
            OrderStatus::PaymentConfirmed,
            OrderStatus::PaymentFailed,
            OrderStatus::ShippingPending,
            OrderStatus::ShippingConfirmed,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Expired,
            OrderStatus::PaymentRefunded,
        ] {
            assert_eq!(OrderStatus::try_from(status.as_str()), Ok(status));
        }
    }
}
