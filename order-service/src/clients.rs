use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use shared::inventory::{InsufficientStockBody, InventoryLedger, InventoryLevel, InventoryRequest};
use shared::{CheckoutError, LineItem};
use tracing::warn;
use uuid::Uuid;

/// Catalog entry as returned by `GET {catalog}/products/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProductQuote {
    pub id: Uuid,
    pub price: i64,
    #[serde(default)]
    pub stock: i32,
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// `None` when the catalog does not know the product.
    async fn price(&self, product_id: Uuid) -> Result<Option<ProductQuote>, CheckoutError>;
}

pub struct HttpProductCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProductCatalog {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ProductCatalog for HttpProductCatalog {
    async fn price(&self, product_id: Uuid) -> Result<Option<ProductQuote>, CheckoutError> {
        let response = self
            .client
            .get(format!("{}/products/{}", self.base_url, product_id))
            .send()
            .await
            .map_err(CheckoutError::transient)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_server_error() => Err(CheckoutError::transient(anyhow::anyhow!(
                "product catalog returned {}",
                status
            ))),
            status if !status.is_success() => {
                warn!(%product_id, %status, "Product catalog refused lookup");
                Ok(None)
            }
            _ => match response.json::<ProductQuote>().await {
                Ok(quote) => Ok(Some(quote)),
                Err(e) => {
                    warn!(%product_id, "Unreadable product catalog response: {}", e);
                    Ok(None)
                }
            },
        }
    }
}

/// [`InventoryLedger`] backed by the inventory service's HTTP API.
pub struct HttpInventoryLedger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInventoryLedger {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, action: &str, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        let request = InventoryRequest {
            order_id,
            items: items.to_vec(),
        };
        let response = self
            .client
            .post(format!("{}/inventory/{}", self.base_url, action))
            .json(&request)
            .send()
            .await
            .map_err(CheckoutError::transient)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::CONFLICT => {
                let body: InsufficientStockBody = response.json().await.map_err(CheckoutError::transient)?;
                Err(CheckoutError::InsufficientStock {
                    product_id: body.product_id,
                    requested: body.requested,
                    available: body.available,
                })
            }
            StatusCode::BAD_REQUEST => {
                let body = response.text().await.unwrap_or_default();
                Err(CheckoutError::Validation(format!("inventory {} rejected: {}", action, body)))
            }
            _ => Err(CheckoutError::transient(anyhow::anyhow!(
                "inventory {} returned {}",
                action,
                status
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    sufficient: bool,
}

#[async_trait]
impl InventoryLedger for HttpInventoryLedger {
    async fn check(&self, product_id: Uuid, quantity: i32) -> Result<bool, CheckoutError> {
        let response = self
            .client
            .get(format!("{}/inventory/{}/check", self.base_url, product_id))
            .query(&[("quantity", quantity)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(CheckoutError::transient)?;
        let body: CheckResponse = response.json().await.map_err(CheckoutError::transient)?;
        Ok(body.sufficient)
    }

    async fn reserve(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        self.post("reserve", order_id, items).await
    }

    async fn confirm(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        self.post("confirm", order_id, items).await
    }

    async fn release(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        self.post("release", order_id, items).await
    }

    async fn level(&self, product_id: Uuid) -> Result<Option<InventoryLevel>, CheckoutError> {
        let response = self
            .client
            .get(format!("{}/inventory/{}", self.base_url, product_id))
            .send()
            .await
            .map_err(CheckoutError::transient)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let level = response
            .error_for_status()
            .map_err(CheckoutError::transient)?
            .json::<InventoryLevel>()
            .await
            .map_err(CheckoutError::transient)?;
        Ok(Some(level))
    }
}

#[cfg(test)]
pub use fixed::FixedCatalog;
