pub mod adapters;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fees;
pub mod services;
pub mod store;

pub use adapters::{
    ChatBridge, CourierRateClient, FlatRateEstimator, MemoryChatBridge, PostgresChatBridge,
    SettlementGateway, ShipmentEstimator, SimulatedGateway, StripeGateway,
};
pub use config::AppConfig;
pub use domain::{
    Listing, ListingStatus, MessageKind, Order, OrderSource, OrderStatus, Proposal, ProposalStatus,
};
pub use engine::{OrderEngine, PaymentPolicy, ProposalEngine, PROPOSAL_TTL_DAYS};
pub use error::{HaggleError, Result};
pub use fees::{FeeCalculator, FeeQuote, FEE_CALCULATOR_VERSION};
pub use services::{ExpirySweeper, ExpirySweeperConfig};
pub use store::{MarketStore, MemoryStore, PostgresStore};
