//! Expiry sweep background service
//!
//! Periodically converts stale rows:
//! - pending proposals past their `expires_at` become `expired`
//! - `payment_pending` orders past the payment window become `expired`
//!   and their listing claims are released
//!
//! Both conversions are conditional updates, so the sweep is idempotent and
//! safe to run alongside the lazy expiry every read performs.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::engine::{OrderEngine, ProposalEngine};
use crate::error::Result;

/// Configuration for the expiry sweeper
#[derive(Debug, Clone)]
pub struct ExpirySweeperConfig {
    /// Interval between sweep cycles (seconds)
    pub interval_secs: u64,
}

impl Default for ExpirySweeperConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

/// Sweep statistics
#[derive(Debug, Clone, Default)]
pub struct SweepStats {
    pub cycles: u64,
    pub proposals_expired: u64,
    pub orders_expired: u64,
    pub errors: u64,
    pub last_run: Option<DateTime<Utc>>,
}

/// Expiry sweep service
pub struct ExpirySweeper {
    proposals: Arc<ProposalEngine>,
    orders: Arc<OrderEngine>,
    config: ExpirySweeperConfig,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<SweepStats>>,
}

impl ExpirySweeper {
    pub fn new(
        proposals: Arc<ProposalEngine>,
        orders: Arc<OrderEngine>,
        config: ExpirySweeperConfig,
    ) -> Self {
        Self {
            proposals,
            orders,
            config,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(SweepStats::default())),
        }
    }

    /// One sweep cycle. Also the entry point for CLI-triggered sweeps.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<(u64, u64)> {
        let proposals_expired = self.proposals.expire_stale(now).await?;
        let orders_expired = self.orders.expire_stale(now).await?;

        let mut stats = self.stats.write().await;
        stats.cycles += 1;
        stats.proposals_expired += proposals_expired;
        stats.orders_expired += orders_expired;
        stats.last_run = Some(now);

        if proposals_expired > 0 || orders_expired > 0 {
            info!(
                "Sweep cycle: {} proposals, {} orders expired",
                proposals_expired, orders_expired
            );
        }
        Ok((proposals_expired, orders_expired))
    }

    /// Run the sweep loop until `stop()` is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Expiry sweeper started (every {}s)",
            self.config.interval_secs
        );

        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.interval_secs));
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if let Err(e) = self.run_once(Utc::now()).await {
                self.stats.write().await.errors += 1;
                error!("Sweep cycle failed: {}", e);
            }
        }

        info!("Expiry sweeper stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> SweepStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FlatRateEstimator, MemoryChatBridge, SimulatedGateway};
    use crate::domain::{Listing, ListingStatus};
    use crate::engine::PaymentPolicy;
    use crate::store::{MarketStore, MemoryStore};
    use chrono::Duration;

    fn sweeper_with_seeded_rows() -> (Arc<MemoryStore>, ExpirySweeper) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let chat = Arc::new(MemoryChatBridge::new());
        let orders = Arc::new(OrderEngine::new(
            store.clone(),
            Arc::new(SimulatedGateway::new()),
            Arc::new(FlatRateEstimator::new(800)),
            chat.clone(),
            PaymentPolicy::default(),
        ));
        let proposals = Arc::new(ProposalEngine::new(store.clone(), chat, orders.clone()));
        let sweeper = ExpirySweeper::new(proposals, orders, ExpirySweeperConfig::default());
        (store, sweeper)
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let (store, sweeper) = sweeper_with_seeded_rows();
        store.put_listing(Listing {
            id: 1,
            seller_id: 10,
            title: "bookshelf".to_string(),
            price_cents: 9_000,
            easy_pay: true,
            published: true,
            status: ListingStatus::Available,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let listing = store.get_listing(1).await.unwrap().unwrap();
        let mut proposal = crate::domain::Proposal::new(
            &listing,
            3,
            8_000,
            String::new(),
            Duration::days(7),
        );
        proposal.expires_at = Utc::now() - Duration::hours(1);
        store.insert_proposal(&proposal).await.unwrap();

        let now = Utc::now();
        let (p1, o1) = sweeper.run_once(now).await.unwrap();
        assert_eq!((p1, o1), (1, 0));
        // Re-running converts nothing further
        let (p2, o2) = sweeper.run_once(now).await.unwrap();
        assert_eq!((p2, o2), (0, 0));

        let stats = sweeper.stats().await;
        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.proposals_expired, 1);
    }
}
