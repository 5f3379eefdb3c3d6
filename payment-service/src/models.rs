use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use shared::{PaymentEvent, PaymentEventType, PaymentRequest, PaymentStatusView};
use uuid::Uuid;

/// `PENDING` and `URL_READY` are the status values the gateway polls for,
/// so they keep their upper-case wire spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    UrlReady,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::UrlReady => "URL_READY",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(PaymentStatus::Pending),
            "URL_READY" => Some(PaymentStatus::UrlReady),
            "succeeded" => Some(PaymentStatus::Succeeded),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Succeeded | PaymentStatus::Failed)
    }

    pub const TERMINAL: [&'static str; 2] = ["succeeded", "failed"];
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::payments)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub external_session_id: Option<String>,
    pub checkout_url: Option<String>,
    pub succeeded_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn is_terminal(&self) -> bool {
        PaymentStatus::parse(&self.status).is_some_and(|status| status.is_terminal())
    }

    /// A session is reusable once both its id and URL are stored.
    pub fn has_session(&self) -> bool {
        let filled = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        filled(&self.external_session_id) && filled(&self.checkout_url)
    }

    pub fn event(&self, event_type: PaymentEventType, at: DateTime<Utc>) -> PaymentEvent {
        PaymentEvent {
            event_type,
            order_id: self.order_id,
            user_id: self.user_id,
            payment_id: Some(self.id),
            amount: self.amount,
            currency: self.currency.clone(),
            timestamp: at,
        }
    }

    pub fn view(&self) -> PaymentStatusView {
        PaymentStatusView {
            order_id: self.order_id,
            status: self.status.clone(),
            checkout_url: self.checkout_url.clone(),
            session_id: self.external_session_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payments)]
pub struct NewPayment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: String,
}

impl NewPayment {
    pub fn pending(request: &PaymentRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: request.order_id,
            user_id: request.user_id,
            amount: request.amount,
            currency: request.currency.clone(),
            status: PaymentStatus::Pending.as_str().to_string(),
        }
    }
}
