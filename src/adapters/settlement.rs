//! Settlement gateway boundary.
//!
//! The engine moves money exclusively through this narrow contract; the
//! processor's retry/webhook internals live behind it. Calls are treated as
//! at-least-once from the engine's perspective, so every money-moving
//! request carries an idempotency key derived from the order id and
//! duplicate deliveries must not double-charge or double-transfer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{HaggleError, Result};

/// Request to authorize the full collected amount on the buyer's instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntentRequest {
    pub amount_cents: i64,
    pub currency: String,
    /// Seller's connected account, the eventual transfer destination
    pub destination_account_id: String,
    /// Fee components retained by the platform at capture time
    pub application_fee_cents: i64,
    pub idempotency_key: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub account_id: String,
}

/// Escrow release: credit the seller's connected account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub destination_account_id: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    async fn create_payment_intent(&self, request: &PaymentIntentRequest) -> Result<PaymentIntent>;

    async fn create_connected_account(
        &self,
        email: &str,
        country: &str,
        metadata: serde_json::Value,
    ) -> Result<ConnectedAccount>;

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt>;

    async fn refund(&self, intent_id: &str, idempotency_key: &str) -> Result<RefundReceipt>;
}

/// One recorded gateway invocation, for dry-run inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    PaymentIntent { amount_cents: i64, destination: String, idempotency_key: String },
    ConnectedAccount { email: String },
    Transfer { amount_cents: i64, destination: String, idempotency_key: String },
    Refund { intent_id: String, idempotency_key: String },
}

#[derive(Default)]
struct SimulatedState {
    seq: u64,
    intents: HashMap<String, PaymentIntent>,
    transfers: HashMap<String, TransferReceipt>,
    refunds: HashMap<String, RefundReceipt>,
    calls: Vec<GatewayCall>,
    fail_next: bool,
}

/// Dry-run gateway: deterministic ids, a call journal, and idempotency-key
/// replay so a duplicated delivery returns the original receipt instead of
/// moving money twice.
#[derive(Default)]
pub struct SimulatedGateway {
    state: Mutex<SimulatedState>,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next gateway call fail with an upstream error.
    pub fn fail_next(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().unwrap().calls.clone()
    }

    fn check_failure(state: &mut SimulatedState) -> Result<()> {
        if state.fail_next {
            state.fail_next = false;
            return Err(HaggleError::Upstream {
                service: "simulated-gateway",
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SettlementGateway for SimulatedGateway {
    async fn create_payment_intent(&self, request: &PaymentIntentRequest) -> Result<PaymentIntent> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state)?;
        state.calls.push(GatewayCall::PaymentIntent {
            amount_cents: request.amount_cents,
            destination: request.destination_account_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
        });

        if let Some(existing) = state.intents.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }
        state.seq += 1;
        let intent = PaymentIntent {
            intent_id: format!("pi_sim_{}", state.seq),
            client_secret: format!("pi_sim_{}_secret", state.seq),
        };
        state
            .intents
            .insert(request.idempotency_key.clone(), intent.clone());
        Ok(intent)
    }

    async fn create_connected_account(
        &self,
        email: &str,
        _country: &str,
        _metadata: serde_json::Value,
    ) -> Result<ConnectedAccount> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state)?;
        state.calls.push(GatewayCall::ConnectedAccount {
            email: email.to_string(),
        });
        state.seq += 1;
        Ok(ConnectedAccount {
            account_id: format!("acct_sim_{}", state.seq),
        })
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state)?;
        state.calls.push(GatewayCall::Transfer {
            amount_cents: request.amount_cents,
            destination: request.destination_account_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
        });

        if let Some(existing) = state.transfers.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }
        state.seq += 1;
        let receipt = TransferReceipt {
            transfer_id: format!("tr_sim_{}", state.seq),
        };
        state
            .transfers
            .insert(request.idempotency_key.clone(), receipt.clone());
        Ok(receipt)
    }

    async fn refund(&self, intent_id: &str, idempotency_key: &str) -> Result<RefundReceipt> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state)?;
        state.calls.push(GatewayCall::Refund {
            intent_id: intent_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
        });

        if let Some(existing) = state.refunds.get(idempotency_key) {
            return Ok(existing.clone());
        }
        state.seq += 1;
        let receipt = RefundReceipt {
            refund_id: format!("re_sim_{}", state.seq),
        };
        state
            .refunds
            .insert(idempotency_key.to_string(), receipt.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent_request(key: &str) -> PaymentIntentRequest {
        PaymentIntentRequest {
            amount_cents: 16_601,
            currency: "eur".to_string(),
            destination_account_id: "acct_1".to_string(),
            application_fee_cents: 801,
            idempotency_key: key.to_string(),
            metadata: json!({"order_id": 1}),
        }
    }

    #[tokio::test]
    async fn test_idempotent_intent_replay() {
        let gateway = SimulatedGateway::new();
        let first = gateway.create_payment_intent(&intent_request("order-1")).await.unwrap();
        let second = gateway.create_payment_intent(&intent_request("order-1")).await.unwrap();
        assert_eq!(first.intent_id, second.intent_id);

        let other = gateway.create_payment_intent(&intent_request("order-2")).await.unwrap();
        assert_ne!(first.intent_id, other.intent_id);
    }

    #[tokio::test]
    async fn test_idempotent_transfer_replay() {
        let gateway = SimulatedGateway::new();
        let request = TransferRequest {
            amount_cents: 14_999,
            currency: "eur".to_string(),
            destination_account_id: "acct_1".to_string(),
            idempotency_key: "order-1-release".to_string(),
        };
        let first = gateway.transfer(&request).await.unwrap();
        let second = gateway.transfer(&request).await.unwrap();
        assert_eq!(first.transfer_id, second.transfer_id);
        // Both deliveries recorded, one transfer made
        assert_eq!(gateway.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_is_upstream() {
        let gateway = SimulatedGateway::new();
        gateway.fail_next();
        let err = gateway.create_payment_intent(&intent_request("order-1")).await.unwrap_err();
        assert!(err.is_retryable());
        // Next call succeeds again
        gateway.create_payment_intent(&intent_request("order-1")).await.unwrap();
    }
}
