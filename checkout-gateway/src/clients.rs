use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::context::RequestContext;
use shared::PaymentStatusView;
use uuid::Uuid;

#[async_trait]
pub trait CartService: Send + Sync {
    async fn item_count(&self, ctx: &RequestContext) -> Result<usize>;

    /// Starts checkout of the caller's cart and returns the new order id.
    async fn trigger_checkout(&self, ctx: &RequestContext, idempotency_key: &str) -> Result<Uuid>;
}

#[async_trait]
pub trait PaymentStatusSource: Send + Sync {
    async fn status(&self, order_id: Uuid) -> Result<PaymentStatusView>;
}

#[derive(Debug, Deserialize)]
struct CartBody {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckoutStarted {
    order_id: Uuid,
}

pub struct HttpCartService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCartService {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn with_identity(&self, mut request: reqwest::RequestBuilder, ctx: &RequestContext) -> reqwest::RequestBuilder {
        for (name, value) in ctx.forwarded_headers() {
            request = request.header(name, value);
        }
        request
    }
}

#[async_trait]
impl CartService for HttpCartService {
    async fn item_count(&self, ctx: &RequestContext) -> Result<usize> {
        let cart: CartBody = self
            .with_identity(self.client.get(format!("{}/cart", self.base_url)), ctx)
            .send()
            .await
            .context("cart service unreachable")?
            .error_for_status()
            .context("cart lookup failed")?
            .json()
            .await
            .context("unreadable cart response")?;
        Ok(cart.items.len())
    }

    async fn trigger_checkout(&self, ctx: &RequestContext, idempotency_key: &str) -> Result<Uuid> {
        let started: CheckoutStarted = self
            .with_identity(self.client.post(format!("{}/cart/checkout", self.base_url)), ctx)
            .header("Idempotency-Key", idempotency_key)
            .send()
            .await
            .context("cart service unreachable")?
            .error_for_status()
            .context("cart checkout failed")?
            .json()
            .await
            .context("unreadable checkout response")?;
        Ok(started.order_id)
    }
}

pub struct HttpPaymentStatus {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentStatus {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PaymentStatusSource for HttpPaymentStatus {
    async fn status(&self, order_id: Uuid) -> Result<PaymentStatusView> {
        let view = self
            .client
            .get(format!("{}/payment/status/by-order/{}", self.base_url, order_id))
            .send()
            .await
            .context("payment service unreachable")?
            .error_for_status()
            .context("payment status lookup failed")?
            .json()
            .await
            .context("unreadable payment status")?;
        Ok(view)
    }
}
