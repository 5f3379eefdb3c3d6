//! Provider webhooks. Signatures follow Stripe's scheme:
//! `Stripe-Signature: t=<unix>,v1=<hex hmac-sha256 of "{t}.{body}">`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use metrics::counter;
use serde::Deserialize;
use sha2::Sha256;
use shared::queue::MessagePublisher;
use shared::{CheckoutError, PaymentEventType};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{emit, outbox_message};
use crate::models::{Payment, PaymentStatus};
use crate::store::{FinalizeOutcome, PaymentStore};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid signature: {0}")]
    Signature(#[from] SignatureError),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] CheckoutError),
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: String,
    pub tolerance: Duration,
}

/// Checks `header` against `payload` at unix time `now`.
pub fn verify_signature(
    header: Option<&str>,
    payload: &[u8],
    secret: &str,
    tolerance: Duration,
    now: i64,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let issued: i64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;
    if (now - issued).unsigned_abs() > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: ProviderEventData,
}

#[derive(Debug, Deserialize)]
struct ProviderEventData {
    object: ProviderObject,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderObject {
    #[serde(default)]
    id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl ProviderObject {
    fn order_id(&self) -> Option<Uuid> {
        self.metadata
            .get("order_id")
            .and_then(|value| Uuid::parse_str(value).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied { order_id: Uuid, status: &'static str },
    Ignored(&'static str),
}

pub struct WebhookHandler {
    store: Arc<dyn PaymentStore>,
    publisher: Arc<dyn MessagePublisher>,
    config: WebhookConfig,
}

impl WebhookHandler {
    pub fn new(store: Arc<dyn PaymentStore>, publisher: Arc<dyn MessagePublisher>, config: WebhookConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub async fn handle(&self, signature: Option<&str>, body: &[u8]) -> Result<WebhookOutcome, WebhookError> {
        if let Err(e) = verify_signature(
            signature,
            body,
            &self.config.secret,
            self.config.tolerance,
            Utc::now().timestamp(),
        ) {
            warn!("Webhook signature verification failed: {}", e);
            counter!("payments_webhook_rejected_total").increment(1);
            return Err(e.into());
        }

        let event: ProviderEvent = serde_json::from_slice(body)?;
        let object = &event.data.object;

        let (payment, status, event_type) = match event.event_type.as_str() {
            "checkout.session.completed" => (
                self.locate_by_session(object).await?,
                PaymentStatus::Succeeded,
                PaymentEventType::PaymentSucceeded,
            ),
            "checkout.session.expired" => (
                self.locate_by_session(object).await?,
                PaymentStatus::Failed,
                PaymentEventType::CheckoutSessionFailed,
            ),
            "payment_intent.succeeded" => (
                self.locate_by_order(object).await?,
                PaymentStatus::Succeeded,
                PaymentEventType::PaymentSucceeded,
            ),
            "payment_intent.payment_failed" => (
                self.locate_by_order(object).await?,
                PaymentStatus::Failed,
                PaymentEventType::PaymentFailed,
            ),
            other => {
                info!(event_id = %event.id, event_type = other, "Ignoring webhook event");
                return Ok(WebhookOutcome::Ignored("unhandled event type"));
            }
        };

        let Some(payment) = payment else {
            warn!(event_id = %event.id, event_type = %event.event_type, object_id = %object.id, "Webhook for unknown payment");
            counter!("payments_webhook_unmatched_total").increment(1);
            return Ok(WebhookOutcome::Ignored("unknown payment"));
        };

        self.settle(payment, status, event_type).await
    }

    /// Session id first. The order in the metadata only matches a payment
    /// that has no session attached yet; one bound to another session is not
    /// this event's payment.
    async fn locate_by_session(&self, object: &ProviderObject) -> Result<Option<Payment>, CheckoutError> {
        if let Some(payment) = self.store.find_by_session(&object.id).await? {
            return Ok(Some(payment));
        }
        let Some(order_id) = object.order_id() else {
            return Ok(None);
        };
        let payment = self.store.find_by_order(order_id).await?;
        Ok(payment.filter(|payment| payment.external_session_id.is_none()))
    }

    async fn locate_by_order(&self, object: &ProviderObject) -> Result<Option<Payment>, CheckoutError> {
        if let Some(order_id) = object.order_id() {
            if let Some(payment) = self.store.find_by_order(order_id).await? {
                return Ok(Some(payment));
            }
        }
        self.store.find_by_session(&object.id).await
    }

    async fn settle(
        &self,
        payment: Payment,
        status: PaymentStatus,
        event_type: PaymentEventType,
    ) -> Result<WebhookOutcome, WebhookError> {
        if payment.is_terminal() {
            info!(order_id = %payment.order_id, status = %payment.status, "Payment already settled, ignoring webhook");
            return Ok(WebhookOutcome::Ignored("already settled"));
        }

        let now = Utc::now();
        let message = outbox_message(&payment, event_type, now)?;
        match self
            .store
            .finalize(payment.id, status, now, message.clone())
            .await?
        {
            FinalizeOutcome::Finalized => {
                info!(order_id = %payment.order_id, status = status.as_str(), "Payment settled");
                emit(&*self.store, &*self.publisher, &message).await;
                Ok(WebhookOutcome::Applied {
                    order_id: payment.order_id,
                    status: status.as_str(),
                })
            }
            FinalizeOutcome::AlreadyTerminal => Ok(WebhookOutcome::Ignored("already settled")),
        }
    }
}
