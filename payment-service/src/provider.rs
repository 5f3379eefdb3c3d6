use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub idempotency_key: String,
}

/// Hosted checkout session returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider refused the request; retrying the same request will not help.
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(&self, request: &SessionRequest) -> Result<CheckoutSession, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub api_base: String,
    pub secret_key: String,
    pub success_url: String,
    pub cancel_url: String,
}

/// Stripe Checkout over its form-encoded REST API.
pub struct StripeProvider {
    client: reqwest::Client,
    config: StripeConfig,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: String,
}

impl StripeProvider {
    pub fn new(client: reqwest::Client, config: StripeConfig) -> Self {
        Self { client, config }
    }

    fn form(&self, request: &SessionRequest) -> Vec<(&'static str, String)> {
        let order_id = request.order_id.to_string();
        let user_id = request.user_id.to_string();
        vec![
            ("mode", "payment".to_string()),
            ("success_url", self.config.success_url.clone()),
            ("cancel_url", self.config.cancel_url.clone()),
            ("client_reference_id", order_id.clone()),
            ("metadata[order_id]", order_id.clone()),
            ("metadata[user_id]", user_id.clone()),
            ("payment_intent_data[metadata][order_id]", order_id.clone()),
            ("payment_intent_data[metadata][user_id]", user_id),
            ("line_items[0][quantity]", "1".to_string()),
            ("line_items[0][price_data][currency]", request.currency.to_lowercase()),
            ("line_items[0][price_data][unit_amount]", request.amount.to_string()),
            ("line_items[0][price_data][product_data][name]", format!("Order {}", order_id)),
        ]
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn create_checkout_session(&self, request: &SessionRequest) -> Result<CheckoutSession, ProviderError> {
        let response = self
            .client
            .post(format!(
                "{}/v1/checkout/sessions",
                self.config.api_base.trim_end_matches('/')
            ))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&self.form(request))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<CheckoutSession>()
                .await
                .map_err(|e| ProviderError::Unavailable(format!("unreadable session response: {}", e)));
        }

        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StripeErrorBody>(&body)
                .map(|parsed| parsed.error.message)
                .unwrap_or(body);
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Err(ProviderError::Unavailable(format!("checkout session request returned {}", status)))
    }
}

#[cfg(test)]
pub use scripted::ScriptedProvider;
