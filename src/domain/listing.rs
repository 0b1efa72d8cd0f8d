use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Listing availability.
///
/// `Reserved` is the claim an order creation takes on the listing row; it is
/// the serialization point for concurrent buy-now/accept attempts. `Sold` is
/// only ever written when an order completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Available,
    Reserved,
    Sold,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Available => "available",
            ListingStatus::Reserved => "reserved",
            ListingStatus::Sold => "sold",
        }
    }
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ListingStatus {
    type Error = String;

    fn try_from(raw: &str) -> std::result::Result<Self, Self::Error> {
        match raw {
            "available" => Ok(ListingStatus::Available),
            "reserved" => Ok(ListingStatus::Reserved),
            "sold" => Ok(ListingStatus::Sold),
            other => Err(format!("unknown listing status: {other}")),
        }
    }
}

/// A marketplace listing, referenced by the engines.
///
/// The listing CRUD surface lives elsewhere; this core only reads listings
/// and moves their status through the claim cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub seller_id: i64,
    pub title: String,
    /// Asking price in minor currency units (cents)
    pub price_cents: i64,
    /// Eligible for platform-mediated payment
    pub easy_pay: bool,
    pub published: bool,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    /// Whether a buyer action (buy-now or proposal) may start against this listing.
    pub fn is_purchasable(&self) -> bool {
        self.published && self.easy_pay && self.status == ListingStatus::Available
    }
}
