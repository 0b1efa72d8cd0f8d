//! Shipment estimator boundary.
//!
//! The engine fetches a shipping price exactly once, at order creation, and
//! snapshots it on the order. Estimation failures are surfaced as
//! `ShippingUnavailable` and abort the creation.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{HaggleError, Result};

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingQuote {
    pub amount_cents: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShipmentEstimator: Send + Sync {
    async fn estimate(&self, listing_id: i64, buyer_address_id: i64) -> Result<ShippingQuote>;
}

#[derive(Deserialize)]
struct RateResponse {
    amount_cents: i64,
}

/// HTTP courier-rate adapter: `GET {base_url}/rates?listing_id=&address_id=`.
#[derive(Clone)]
pub struct CourierRateClient {
    http: Client,
    base_url: String,
}

impl CourierRateClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent("haggle-shipping/0.1")
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| {
                HaggleError::Internal(format!("failed to build courier HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ShipmentEstimator for CourierRateClient {
    async fn estimate(&self, listing_id: i64, buyer_address_id: i64) -> Result<ShippingQuote> {
        let url = format!(
            "{}/rates?listing_id={}&address_id={}",
            self.base_url, listing_id, buyer_address_id
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| HaggleError::ShippingUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(HaggleError::ShippingUnavailable(format!(
                "courier API returned {}",
                response.status()
            )));
        }

        let rate: RateResponse = response
            .json()
            .await
            .map_err(|e| HaggleError::ShippingUnavailable(e.to_string()))?;

        if rate.amount_cents < 0 {
            return Err(HaggleError::ShippingUnavailable(format!(
                "negative rate {} for listing {}",
                rate.amount_cents, listing_id
            )));
        }

        Ok(ShippingQuote {
            amount_cents: rate.amount_cents,
        })
    }
}

/// Fixed-rate estimator for dry-run sessions and tests.
#[derive(Debug, Clone, Copy)]
pub struct FlatRateEstimator {
    amount_cents: i64,
}

impl FlatRateEstimator {
    pub fn new(amount_cents: i64) -> Self {
        Self { amount_cents }
    }
}

#[async_trait]
impl ShipmentEstimator for FlatRateEstimator {
    async fn estimate(&self, _listing_id: i64, _buyer_address_id: i64) -> Result<ShippingQuote> {
        Ok(ShippingQuote {
            amount_cents: self.amount_cents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flat_rate() {
        let estimator = FlatRateEstimator::new(800);
        let quote = estimator.estimate(1, 2).await.unwrap();
        assert_eq!(quote.amount_cents, 800);
    }
}
