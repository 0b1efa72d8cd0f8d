use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::Listing;

/// Proposal status.
///
/// `Pending` is the only live state; the three others are terminal and no
/// transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Accepted | ProposalStatus::Rejected | ProposalStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ProposalStatus {
    type Error = String;

    fn try_from(raw: &str) -> std::result::Result<Self, Self::Error> {
        match raw {
            "pending" => Ok(ProposalStatus::Pending),
            "accepted" => Ok(ProposalStatus::Accepted),
            "rejected" => Ok(ProposalStatus::Rejected),
            "expired" => Ok(ProposalStatus::Expired),
            other => Err(format!("unknown proposal status: {other}")),
        }
    }
}

/// A buyer-initiated counter-offer on a listing's price, negotiated through
/// chat, with a fixed expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Option<i64>,
    pub listing_id: i64,
    pub buyer_id: i64,
    pub seller_id: i64,
    /// Offered price in minor currency units; `0 < proposal_price < listing.price`
    pub proposal_price_cents: i64,
    /// Free text accompanying the offer
    pub message: String,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new(
        listing: &Listing,
        buyer_id: i64,
        proposal_price_cents: i64,
        message: String,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            listing_id: listing.id,
            buyer_id,
            seller_id: listing.seller_id,
            proposal_price_cents,
            message,
            status: ProposalStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// A pending proposal past its expiry must never be observed as pending;
    /// readers flip it before acting on it.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ProposalStatus::Pending && now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ListingStatus;

    fn listing() -> Listing {
        Listing {
            id: 1,
            seller_id: 10,
            title: "road bike".to_string(),
            price_cents: 45_000,
            easy_pay: true,
            published: true,
            status: ListingStatus::Available,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ProposalStatus::Pending.is_terminal());
        assert!(ProposalStatus::Accepted.is_terminal());
        assert!(ProposalStatus::Rejected.is_terminal());
        assert!(ProposalStatus::Expired.is_terminal());
    }

    #[test]
    fn test_new_proposal_expiry() {
        let proposal = Proposal::new(&listing(), 3, 40_000, "would you take 400?".into(), Duration::days(7));
        assert_eq!(proposal.status, ProposalStatus::Pending);
        assert_eq!(proposal.seller_id, 10);
        assert!(!proposal.is_expired(Utc::now()));
        assert!(proposal.is_expired(Utc::now() + Duration::days(8)));
    }

    #[test]
    fn test_expired_only_applies_to_pending() {
        let mut proposal =
            Proposal::new(&listing(), 3, 40_000, String::new(), Duration::days(7));
        proposal.status = ProposalStatus::Rejected;
        assert!(!proposal.is_expired(Utc::now() + Duration::days(30)));
    }
}
