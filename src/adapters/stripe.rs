//! Stripe-shaped settlement gateway (native REST, no SDK dependency).
//!
//! Money-moving calls pass the engine's idempotency key through the
//! `Idempotency-Key` header, so network-level retries collapse into a single
//! charge or transfer on the processor side.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::settlement::{
    ConnectedAccount, PaymentIntent, PaymentIntentRequest, RefundReceipt, SettlementGateway,
    TransferReceipt, TransferRequest,
};
use crate::error::{HaggleError, Result};

const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct StripeGateway {
    http: Client,
    base_url: String,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(base_url: Option<&str>, secret_key: String) -> Result<Self> {
        let base_url = base_url
            .unwrap_or(DEFAULT_STRIPE_API_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("haggle-settlement/0.1")
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| HaggleError::Internal(format!("failed to build Stripe HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            secret_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_form(
        &self,
        path: &str,
        params: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(params);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body: Value = response.json().await?;

        if !status.is_success() {
            let reason = body["error"]["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string();
            return Err(HaggleError::Upstream {
                service: "stripe",
                reason,
            });
        }

        debug!("Stripe {} succeeded", path);
        Ok(body)
    }

    /// Stripe encodes nested metadata as `metadata[key]=value` form fields.
    fn metadata_params(metadata: &Value, params: &mut Vec<(String, String)>) {
        if let Some(map) = metadata.as_object() {
            for (key, value) in map {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                params.push((format!("metadata[{key}]"), rendered));
            }
        }
    }

    fn require_str(body: &Value, field: &str) -> Result<String> {
        body[field]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| HaggleError::Upstream {
                service: "stripe",
                reason: format!("response missing `{field}`"),
            })
    }
}

#[async_trait]
impl SettlementGateway for StripeGateway {
    async fn create_payment_intent(&self, request: &PaymentIntentRequest) -> Result<PaymentIntent> {
        let mut params = vec![
            ("amount".to_string(), request.amount_cents.to_string()),
            ("currency".to_string(), request.currency.clone()),
            (
                "transfer_data[destination]".to_string(),
                request.destination_account_id.clone(),
            ),
            (
                "application_fee_amount".to_string(),
                request.application_fee_cents.to_string(),
            ),
        ];
        Self::metadata_params(&request.metadata, &mut params);

        let body = self
            .post_form("/v1/payment_intents", &params, Some(&request.idempotency_key))
            .await?;

        Ok(PaymentIntent {
            intent_id: Self::require_str(&body, "id")?,
            client_secret: Self::require_str(&body, "client_secret")?,
        })
    }

    async fn create_connected_account(
        &self,
        email: &str,
        country: &str,
        metadata: Value,
    ) -> Result<ConnectedAccount> {
        let mut params = vec![
            ("type".to_string(), "express".to_string()),
            ("email".to_string(), email.to_string()),
            ("country".to_string(), country.to_string()),
        ];
        Self::metadata_params(&metadata, &mut params);

        let body = self.post_form("/v1/accounts", &params, None).await?;

        Ok(ConnectedAccount {
            account_id: Self::require_str(&body, "id")?,
        })
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt> {
        let params = vec![
            ("amount".to_string(), request.amount_cents.to_string()),
            ("currency".to_string(), request.currency.clone()),
            ("destination".to_string(), request.destination_account_id.clone()),
        ];

        let body = self
            .post_form("/v1/transfers", &params, Some(&request.idempotency_key))
            .await?;

        Ok(TransferReceipt {
            transfer_id: Self::require_str(&body, "id")?,
        })
    }

    async fn refund(&self, intent_id: &str, idempotency_key: &str) -> Result<RefundReceipt> {
        let params = vec![("payment_intent".to_string(), intent_id.to_string())];

        let body = self
            .post_form("/v1/refunds", &params, Some(idempotency_key))
            .await?;

        Ok(RefundReceipt {
            refund_id: Self::require_str(&body, "id")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_flattening() {
        let mut params = Vec::new();
        StripeGateway::metadata_params(&json!({"order_id": 42, "source": "buy_now"}), &mut params);
        params.sort();
        assert_eq!(
            params,
            vec![
                ("metadata[order_id]".to_string(), "42".to_string()),
                ("metadata[source]".to_string(), "buy_now".to_string()),
            ]
        );
    }

    #[test]
    fn test_base_url_trimmed() {
        let gateway = StripeGateway::new(Some("https://mock.stripe.local/"), "sk_test".into()).unwrap();
        assert_eq!(gateway.base_url(), "https://mock.stripe.local");
    }
}
