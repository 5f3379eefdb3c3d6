use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::db::DbPool;
use shared::error::violated_unique_constraint;
use shared::outbox::{self, NewOutboxEvent};
use shared::{CheckoutError, LineItem};
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;

/// Unique constraints that only another delivery of the same checkout can hit.
const DUPLICATE_ORDER_CONSTRAINTS: [&str; 2] = ["orders_pkey", "orders_idempotency_key_key"];

fn is_duplicate_order(constraint: Option<&str>) -> bool {
    constraint.is_some_and(|name| DUPLICATE_ORDER_CONSTRAINTS.contains(&name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Another delivery already created this order or used its idempotency key.
    Duplicate,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// True if an order with this id, or with this idempotency key, exists.
    async fn exists(&self, order_id: Uuid, idempotency_key: Option<&str>) -> Result<bool, CheckoutError>;

    /// Writes the order, its items and the outbox row in one transaction.
    async fn create(
        &self,
        order: NewOrder,
        items: Vec<NewOrderItem>,
        message: NewOutboxEvent,
    ) -> Result<CreateOutcome, CheckoutError>;

    async fn mark_published(&self, outbox_id: Uuid) -> Result<(), CheckoutError>;

    /// Locks the order, applies the payment outcome and returns what changed
    /// together with the order's line items. `None` if the order is unknown.
    async fn apply_payment_outcome(
        &self,
        order_id: Uuid,
        outcome: PaymentOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<(Transition, Vec<LineItem>)>, CheckoutError>;

    async fn find(&self, order_id: Uuid) -> Result<Option<(Order, Vec<OrderItem>)>, CheckoutError>;
}

pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn exists(&self, order_id: Uuid, idempotency_key: Option<&str>) -> Result<bool, CheckoutError> {
        let mut conn = self.pool.get().await?;

        let by_id = orders::table
            .find(order_id)
            .select(orders::id)
            .first::<Uuid>(&mut conn)
            .await
            .optional()?;
        if by_id.is_some() {
            return Ok(true);
        }

        let Some(key) = idempotency_key else {
            return Ok(false);
        };
        let by_key = orders::table
            .filter(orders::idempotency_key.eq(key))
            .select(orders::id)
            .first::<Uuid>(&mut conn)
            .await
            .optional()?;
        Ok(by_key.is_some())
    }

    async fn create(
        &self,
        order: NewOrder,
        items: Vec<NewOrderItem>,
        message: NewOutboxEvent,
    ) -> Result<CreateOutcome, CheckoutError> {
        let mut conn = self.pool.get().await?;

        let result = conn
            .transaction::<_, CheckoutError, _>(|conn| {
                Box::pin(async move {
                    diesel::insert_into(orders::table)
                        .values(&order)
                        .execute(conn)
                        .await
                        .map_err(|e| {
                            if is_duplicate_order(violated_unique_constraint(&e)) {
                                CheckoutError::Duplicate(format!("order {}", order.id))
                            } else {
                                e.into()
                            }
                        })?;

                    diesel::insert_into(order_items::table)
                        .values(&items)
                        .execute(conn)
                        .await?;

                    outbox::insert(conn, &message).await?;
                    Ok(())
                })
            })
            .await;

        match result {
            Ok(()) => Ok(CreateOutcome::Created),
            Err(CheckoutError::Duplicate(_)) => Ok(CreateOutcome::Duplicate),
            Err(e) => Err(e),
        }
    }

    async fn mark_published(&self, outbox_id: Uuid) -> Result<(), CheckoutError> {
        let mut conn = self.pool.get().await?;
        outbox::mark_processed(&mut conn, outbox_id).await?;
        Ok(())
    }

    async fn apply_payment_outcome(
        &self,
        order_id: Uuid,
        outcome: PaymentOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<(Transition, Vec<LineItem>)>, CheckoutError> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, CheckoutError, _>(|conn| {
            Box::pin(async move {
                let order = orders::table
                    .find(order_id)
                    .for_update()
                    .select(Order::as_select())
                    .first::<Order>(conn)
                    .await
                    .optional()?;
                let Some(order) = order else {
                    return Ok(None);
                };

                let transition = order.plan(outcome, at);
                match &transition {
                    Transition::Applied { status, at } | Transition::Backfilled { status, at } => {
                        let target = orders::table.find(order_id);
                        match status {
                            OrderStatus::Paid => {
                                diesel::update(target)
                                    .set((
                                        orders::status.eq(status.as_str()),
                                        orders::completed_at.eq(Some(*at)),
                                    ))
                                    .execute(conn)
                                    .await?;
                            }
                            OrderStatus::PaymentFailed => {
                                diesel::update(target)
                                    .set((
                                        orders::status.eq(status.as_str()),
                                        orders::canceled_at.eq(Some(*at)),
                                    ))
                                    .execute(conn)
                                    .await?;
                            }
                            OrderStatus::PendingPayment => {}
                        }
                    }
                    Transition::Unchanged | Transition::Refused { .. } => {}
                }

                let items = order_items::table
                    .filter(order_items::order_id.eq(order_id))
                    .select(OrderItem::as_select())
                    .load::<OrderItem>(conn)
                    .await?;

                Ok(Some((transition, items.iter().map(OrderItem::line_item).collect())))
            })
        })
        .await
    }

    async fn find(&self, order_id: Uuid) -> Result<Option<(Order, Vec<OrderItem>)>, CheckoutError> {
        let mut conn = self.pool.get().await?;

        let order = orders::table
            .find(order_id)
            .select(Order::as_select())
            .first::<Order>(&mut conn)
            .await
            .optional()?;
        let Some(order) = order else {
            return Ok(None);
        };

        let items = order_items::table
            .filter(order_items::order_id.eq(order_id))
            .select(OrderItem::as_select())
            .load::<OrderItem>(&mut conn)
            .await?;
        Ok(Some((order, items)))
    }
}

#[cfg(test)]
pub use memory::InMemoryOrderStore;


#[cfg(test)]
mod tests {
    use super::*;
    use shared::PAYMENT_REQUESTS_TOPIC;

    fn new_order(order_number: &str, key: Option<&str>) -> NewOrder {
        NewOrder {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount: 100,
            status: OrderStatus::PendingPayment.as_str().to_string(),
            order_number: order_number.to_string(),
            idempotency_key: key.map(str::to_string),
        }
    }

    fn message(order_id: Uuid) -> NewOutboxEvent {
        NewOutboxEvent::new(order_id, PAYMENT_REQUESTS_TOPIC, "payment_request", &order_id).unwrap()
    }

    #[test]
    fn only_id_and_idempotency_key_conflicts_are_duplicates() {
        assert!(is_duplicate_order(Some("orders_pkey")));
        assert!(is_duplicate_order(Some("orders_idempotency_key_key")));
        assert!(!is_duplicate_order(Some("orders_order_number_key")));
        assert!(!is_duplicate_order(None));
    }

    #[tokio::test]
    async fn order_number_conflict_is_retried_not_treated_as_duplicate() {
        let store = InMemoryOrderStore::new();
        let first = new_order("ORD-20261018-3F2A9C1B", Some("K1"));
        store
            .create(first.clone(), Vec::new(), message(first.id))
            .await
            .unwrap();

        let second = new_order("ORD-20261018-3F2A9C1B", Some("K2"));
        let err = store
            .create(second.clone(), Vec::new(), message(second.id))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(store.order_count(), 1);
        assert!(store.order(second.id).is_none());
    }
}
