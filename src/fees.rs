//! Marketplace fee policy.
//!
//! Two independent charges, both computed from integer minor units (cents)
//! and rounded half-up to the nearest cent:
//!
//! - **Platform charge**: tiered commission on the item price alone. The
//!   tier applies to the whole amount, not marginally, and boundaries are
//!   half-open with the boundary amount in the lower (cheaper) tier:
//!   an item of exactly 100.00 pays the 100-200 rate.
//! - **Payment-provider charge**: `amount * 0.25% + 0.10`, levied on the
//!   full collected amount (item + shipping + platform charge).
//!
//! The asymmetry between the two bases is intentional and load-bearing.
//! The policy is data, not control flow: `PLATFORM_FEE_TIERS` below is the
//! single authoritative table.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::error::{HaggleError, Result};

/// Tag persisted with every order so historical fee snapshots remain
/// auditable if the formula changes later.
pub const FEE_CALCULATOR_VERSION: &str = "2024-1";

/// Platform commission tiers: `(upper bound exclusive in cents, rate in bps)`.
///
/// Euro view: [0,100)→6%, [100,200)→5%, [200,500)→4.5%, [500,1000)→4%,
/// [1000,2000)→3.5%, [2000,5000)→3%, [5000,10000)→2.5%, [10000,∞)→2%.
const PLATFORM_FEE_TIERS: &[(i64, u32)] = &[
    (10_000, 600),
    (20_000, 500),
    (50_000, 450),
    (100_000, 400),
    (200_000, 350),
    (500_000, 300),
    (1_000_000, 250),
    (i64::MAX, 200),
];

/// Payment-provider rate: 0.25% of the collected amount...
const PROVIDER_RATE_BPS: u32 = 25;
/// ...plus a fixed 0.10 per charge.
const PROVIDER_FIXED_CENTS: i64 = 10;

/// Payment-provider charge with the version tag it was computed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderCharge {
    pub amount_cents: i64,
    pub calculator_version: &'static str,
}

/// Creation-time fee snapshot for one order (or a proposal preview, with
/// shipping still unknown and passed as zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeQuote {
    pub item_price_cents: i64,
    pub shipping_price_cents: i64,
    pub platform_charge_cents: i64,
    pub payment_provider_charge_cents: i64,
    pub calculator_version: &'static str,
}

impl FeeQuote {
    /// Amount to authorize on the buyer's payment instrument.
    pub fn total_cents(&self) -> i64 {
        self.item_price_cents
            + self.shipping_price_cents
            + self.platform_charge_cents
            + self.payment_provider_charge_cents
    }
}

/// Deterministic, side-effect-free fee computation. Pure function of its
/// inputs; no I/O, no floating point.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeeCalculator;

impl FeeCalculator {
    /// Tier rate (bps) for an item price.
    pub fn platform_rate_bps(&self, item_price_cents: i64) -> Result<u32> {
        if item_price_cents <= 0 {
            return Err(HaggleError::InvalidAmount(item_price_cents));
        }
        let (_, rate) = PLATFORM_FEE_TIERS
            .iter()
            .find(|(upper, _)| item_price_cents < *upper)
            .copied()
            .unwrap_or((i64::MAX, 200));
        Ok(rate)
    }

    /// Tiered marketplace commission on the pre-shipping item price.
    pub fn platform_charge(&self, item_price_cents: i64) -> Result<i64> {
        let rate = self.platform_rate_bps(item_price_cents)?;
        Ok(apply_bps(item_price_cents, rate))
    }

    /// Processor pass-through cost on the full collected amount.
    pub fn payment_provider_charge(&self, collected_cents: i64) -> Result<ProviderCharge> {
        if collected_cents <= 0 {
            return Err(HaggleError::InvalidAmount(collected_cents));
        }
        Ok(ProviderCharge {
            amount_cents: apply_bps(collected_cents, PROVIDER_RATE_BPS) + PROVIDER_FIXED_CENTS,
            calculator_version: FEE_CALCULATOR_VERSION,
        })
    }

    /// Combined quote: platform charge on the item price, provider charge on
    /// `item + shipping + platform`.
    pub fn quote(&self, item_price_cents: i64, shipping_price_cents: i64) -> Result<FeeQuote> {
        if shipping_price_cents < 0 {
            return Err(HaggleError::InvalidAmount(shipping_price_cents));
        }
        let platform_charge_cents = self.platform_charge(item_price_cents)?;
        let collected = item_price_cents + shipping_price_cents + platform_charge_cents;
        let provider = self.payment_provider_charge(collected)?;
        Ok(FeeQuote {
            item_price_cents,
            shipping_price_cents,
            platform_charge_cents,
            payment_provider_charge_cents: provider.amount_cents,
            calculator_version: provider.calculator_version,
        })
    }
}

/// `cents * bps / 10_000`, rounded half-up to the nearest cent.
fn apply_bps(cents: i64, bps: u32) -> i64 {
    let exact = Decimal::from(cents) * Decimal::from(bps) / Decimal::from(10_000);
    exact
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}
