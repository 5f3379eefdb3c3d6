use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bootstrap;
pub mod consumer;
pub mod context;
pub mod db;
pub mod envelope;
pub mod error;
pub mod inventory;
pub mod outbox;
pub mod queue;
pub mod tasks;

pub use envelope::parse_message;
pub use error::{CheckoutError, Disposition};

pub const CHECKOUT_EVENTS_TOPIC: &str = "checkout-events";
pub const PAYMENT_REQUESTS_TOPIC: &str = "payment-requests";
pub const PAYMENT_EVENTS_TOPIC: &str = "payment-events";

pub const DEFAULT_CURRENCY: &str = "usd";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Emitted by the cart service when a user checks out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutEvent {
    pub user_id: Uuid,
    pub order_id: Uuid,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub items: Vec<LineItem>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventType {
    PaymentSucceeded,
    PaymentFailed,
    CheckoutSessionCreated,
    CheckoutSessionFailed,
    #[serde(other)]
    Unknown,
}

impl PaymentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentEventType::PaymentSucceeded => "payment_succeeded",
            PaymentEventType::PaymentFailed => "payment_failed",
            PaymentEventType::CheckoutSessionCreated => "checkout_session_created",
            PaymentEventType::CheckoutSessionFailed => "checkout_session_failed",
            PaymentEventType::Unknown => "unknown",
        }
    }
}

/// Standardized payment outcome published by the payment service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    #[serde(rename = "type")]
    pub event_type: PaymentEventType,
    pub order_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub payment_id: Option<Uuid>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Read model served by `GET /payment/status/by-order/{order_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatusView {
    pub order_id: Uuid,
    pub status: String,
    pub checkout_url: Option<String>,
    pub session_id: Option<String>,
}

impl PaymentStatusView {
    pub const PENDING: &'static str = "PENDING";

    pub fn pending(order_id: Uuid) -> Self {
        Self {
            order_id,
            status: Self::PENDING.to_string(),
            checkout_url: None,
            session_id: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.checkout_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}
