use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::LineItem;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    PaymentFailed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::PaymentFailed => "payment_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending_payment" => Some(OrderStatus::PendingPayment),
            "paid" => Some(OrderStatus::Paid),
            "payment_failed" => Some(OrderStatus::PaymentFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Paid,
    Failed,
}

impl PaymentOutcome {
    pub fn target(&self) -> OrderStatus {
        match self {
            PaymentOutcome::Paid => OrderStatus::Paid,
            PaymentOutcome::Failed => OrderStatus::PaymentFailed,
        }
    }
}

/// What applying a payment outcome does to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// pending_payment moved to the outcome's status, stamped at `at`.
    Applied { status: OrderStatus, at: DateTime<Utc> },
    /// Status already matched but its timestamp was never written.
    Backfilled { status: OrderStatus, at: DateTime<Utc> },
    /// Replay of an outcome that is already fully recorded.
    Unchanged,
    /// The order already settled the other way.
    Refused { current: String },
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub status: String,
    pub order_number: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn plan(&self, outcome: PaymentOutcome, now: DateTime<Utc>) -> Transition {
        let target = outcome.target();
        let stamped = match outcome {
            PaymentOutcome::Paid => self.completed_at,
            PaymentOutcome::Failed => self.canceled_at,
        };

        match OrderStatus::parse(&self.status) {
            Some(current) if current == target => match stamped {
                Some(_) => Transition::Unchanged,
                None => Transition::Backfilled { status: target, at: now },
            },
            Some(OrderStatus::PendingPayment) => Transition::Applied { status: target, at: now },
            _ => Transition::Refused {
                current: self.status.clone(),
            },
        }
    }

    /// Applies a planned transition to this in-memory copy.
    pub fn apply(&mut self, transition: &Transition) {
        let (status, at) = match transition {
            Transition::Applied { status, at } | Transition::Backfilled { status, at } => (*status, *at),
            Transition::Unchanged | Transition::Refused { .. } => return,
        };
        self.status = status.as_str().to_string();
        match status {
            OrderStatus::Paid => self.completed_at = Some(at),
            OrderStatus::PaymentFailed => self.canceled_at = Some(at),
            OrderStatus::PendingPayment => {}
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub status: String,
    pub order_number: String,
    pub idempotency_key: Option<String>,
}

impl NewOrder {
    pub fn pending(
        id: Uuid,
        user_id: Uuid,
        amount: i64,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            amount,
            status: OrderStatus::PendingPayment.as_str().to_string(),
            order_number: order_number(id, now),
            idempotency_key,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = crate::schema::order_items)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: i64,
}

impl OrderItem {
    pub fn line_item(&self) -> LineItem {
        LineItem {
            product_id: self.product_id,
            quantity: self.quantity,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct NewOrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: i64,
}

/// Human-facing order reference, e.g.
/// `ORD-20240518-3F2A9C1B00004000800000000000000A`. Carries the whole id so two
/// orders never share a number.
pub fn order_number(order_id: Uuid, created: DateTime<Utc>) -> String {
    format!(
        "ORD-{}-{}",
        created.format("%Y%m%d"),
        order_id.simple().to_string().to_uppercase()
    )
}
