pub mod chat;
pub mod settlement;
pub mod shipping;
pub mod stripe;

pub use chat::{ChatBridge, MemoryChatBridge, PostgresChatBridge};
pub use settlement::{
    ConnectedAccount, GatewayCall, PaymentIntent, PaymentIntentRequest, RefundReceipt,
    SettlementGateway, SimulatedGateway, TransferReceipt, TransferRequest,
};
pub use shipping::{CourierRateClient, FlatRateEstimator, ShipmentEstimator, ShippingQuote};
pub use stripe::StripeGateway;
