//! Turns `checkout-events` into pending orders and asks the payment service
//! for a checkout session.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use shared::consumer::MessageHandler;
use shared::inventory::InventoryLedger;
use shared::outbox::{self, NewOutboxEvent};
use shared::queue::MessagePublisher;
use shared::{parse_message, CheckoutError, CheckoutEvent, LineItem, PaymentRequest, PAYMENT_REQUESTS_TOPIC};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::ProductCatalog;
use crate::models::{NewOrder, NewOrderItem};
use crate::store::{CreateOutcome, OrderStore};

/// What to do when inventory cannot be reserved for a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReservationPolicy {
    /// Log the failure and create the order anyway.
    BestEffort,
    /// Drop the checkout on a stock shortfall; retry on ledger outages.
    Required,
}

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub policy: ReservationPolicy,
    pub currency: String,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            policy: ReservationPolicy::Required,
            currency: shared::DEFAULT_CURRENCY.to_string(),
        }
    }
}

pub struct CheckoutIntakeConsumer {
    store: Arc<dyn OrderStore>,
    catalog: Arc<dyn ProductCatalog>,
    ledger: Arc<dyn InventoryLedger>,
    publisher: Arc<dyn MessagePublisher>,
    config: IntakeConfig,
}

struct PricedItem {
    product_id: Uuid,
    quantity: i32,
    unit_price: i64,
}

impl CheckoutIntakeConsumer {
    pub fn new(
        store: Arc<dyn OrderStore>,
        catalog: Arc<dyn ProductCatalog>,
        ledger: Arc<dyn InventoryLedger>,
        publisher: Arc<dyn MessagePublisher>,
        config: IntakeConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            ledger,
            publisher,
            config,
        }
    }

    async fn price_items(&self, event: &CheckoutEvent) -> Result<Vec<PricedItem>, CheckoutError> {
        let mut priced = Vec::with_capacity(event.items.len());
        for item in &event.items {
            if item.quantity <= 0 {
                warn!(order_id = %event.order_id, product_id = %item.product_id, quantity = item.quantity, "Skipping item with non-positive quantity");
                continue;
            }
            match self.catalog.price(item.product_id).await? {
                Some(quote) if quote.price >= 0 => priced.push(PricedItem {
                    product_id: item.product_id,
                    quantity: item.quantity,
                    unit_price: quote.price,
                }),
                Some(quote) => {
                    warn!(order_id = %event.order_id, product_id = %item.product_id, price = quote.price, "Skipping item with negative price");
                }
                None => {
                    warn!(order_id = %event.order_id, product_id = %item.product_id, "Skipping unknown product");
                }
            }
        }
        Ok(priced)
    }

    async fn reserve(&self, order_id: Uuid, items: &[LineItem]) -> Result<(), CheckoutError> {
        let Err(e) = self.ledger.reserve(order_id, items).await else {
            return Ok(());
        };

        match self.config.policy {
            ReservationPolicy::BestEffort => {
                warn!(%order_id, error = %e, "Inventory reservation failed, creating order anyway");
                counter!("orders_reservation_failures_total", "policy" => "best_effort").increment(1);
                Ok(())
            }
            ReservationPolicy::Required => {
                if !e.is_transient() {
                    warn!(%order_id, error = %e, "Inventory reservation refused, dropping checkout");
                    counter!("orders_reservation_failures_total", "policy" => "required").increment(1);
                }
                Err(e)
            }
        }
    }
}

fn total_amount(items: &[PricedItem]) -> Result<i64, CheckoutError> {
    items.iter().try_fold(0i64, |total, item| {
        i64::from(item.quantity)
            .checked_mul(item.unit_price)
            .and_then(|line| total.checked_add(line))
            .ok_or_else(|| CheckoutError::Validation("order amount overflows".to_string()))
    })
}

#[async_trait]
impl MessageHandler for CheckoutIntakeConsumer {
    async fn handle(&self, payload: &str) -> Result<(), CheckoutError> {
        let event: CheckoutEvent = parse_message(payload)?;
        let order_id = event.order_id;

        if self
            .store
            .exists(order_id, event.idempotency_key.as_deref())
            .await?
        {
            info!(%order_id, idempotency_key = ?event.idempotency_key, "Checkout already processed");
            counter!("orders_duplicate_checkouts_total").increment(1);
            return Ok(());
        }

        let priced = self.price_items(&event).await?;
        if priced.is_empty() {
            return Err(CheckoutError::Validation(format!(
                "checkout {} has no orderable items",
                order_id
            )));
        }

        let amount = total_amount(&priced)?;
        let line_items: Vec<LineItem> = priced
            .iter()
            .map(|item| LineItem {
                product_id: item.product_id,
                quantity: item.quantity,
            })
            .collect();

        self.reserve(order_id, &line_items).await?;

        let order = NewOrder::pending(
            order_id,
            event.user_id,
            amount,
            event.idempotency_key.clone(),
            Utc::now(),
        );
        let items = priced
            .iter()
            .map(|item| NewOrderItem {
                id: Uuid::new_v4(),
                order_id,
                product_id: item.product_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect();
        let request = PaymentRequest {
            order_id,
            user_id: event.user_id,
            amount,
            currency: self.config.currency.clone(),
            idempotency_key: event.idempotency_key.clone(),
        };
        let message = NewOutboxEvent::new(order_id, PAYMENT_REQUESTS_TOPIC, "payment_request", &request)?;
        let order_number = order.order_number.clone();

        match self.store.create(order, items, message.clone()).await? {
            CreateOutcome::Created => {}
            CreateOutcome::Duplicate => {
                info!(%order_id, "Order created by a concurrent delivery");
                counter!("orders_duplicate_checkouts_total").increment(1);
                // A different order won the idempotency key; give back what this one held.
                if self.store.find(order_id).await?.is_none() {
                    self.ledger.release(order_id, &line_items).await?;
                }
                return Ok(());
            }
        }

        info!(%order_id, %order_number, amount, "Order created");
        counter!("orders_created_total").increment(1);

        match outbox::publish(&*self.publisher, &message.topic, order_id, &message.payload).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_published(message.id).await {
                    warn!(%order_id, "Payment request sent but outbox row not marked: {}", e);
                }
            }
            Err(e) => {
                warn!(%order_id, "Payment request left for outbox retry: {:#}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::FixedCatalog;
    use crate::models::OrderStatus;
    use crate::store::InMemoryOrderStore;
    use shared::inventory::InMemoryInventoryLedger;
    use shared::queue::InMemoryPublisher;
    use shared::Disposition;

    struct Harness {
        consumer: CheckoutIntakeConsumer,
        store: InMemoryOrderStore,
        ledger: InMemoryInventoryLedger,
        publisher: InMemoryPublisher,
        catalog: FixedCatalog,
    }

    fn harness(catalog: FixedCatalog, policy: ReservationPolicy) -> Harness {
        let store = InMemoryOrderStore::new();
        let ledger = InMemoryInventoryLedger::new();
        let publisher = InMemoryPublisher::new();
        let consumer = CheckoutIntakeConsumer::new(
            Arc::new(store.clone()),
            Arc::new(catalog.clone()),
            Arc::new(ledger.clone()),
            Arc::new(publisher.clone()),
            IntakeConfig {
                policy,
                ..IntakeConfig::default()
            },
        );
        Harness {
            consumer,
            store,
            ledger,
            publisher,
            catalog,
        }
    }

    fn checkout(order_id: Uuid, key: Option<&str>, items: &[(Uuid, i32)]) -> String {
        serde_json::json!({
            "user_id": Uuid::new_v4(),
            "order_id": order_id,
            "idempotency_key": key,
            "items": items
                .iter()
                .map(|(product_id, quantity)| serde_json::json!({ "product_id": product_id, "quantity": quantity }))
                .collect::<Vec<_>>(),
        })
        .to_string()
    }

    #[tokio::test]
    async fn checkout_becomes_pending_order_and_payment_request() {
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        let h = harness(
            FixedCatalog::new().with_price(p1, 100).with_price(p2, 150),
            ReservationPolicy::Required,
        );
        h.ledger.set_stock(p1, 10, 0);
        h.ledger.set_stock(p2, 10, 0);
        let order_id = Uuid::new_v4();

        h.consumer
            .handle(&checkout(order_id, Some("K1"), &[(p1, 2), (p2, 2)]))
            .await
            .unwrap();

        let order = h.store.order(order_id).unwrap();
        assert_eq!(order.amount, 500);
        assert_eq!(order.status, OrderStatus::PendingPayment.as_str());
        assert!(order.order_number.starts_with("ORD-"));
        assert_eq!(h.store.items(order_id).len(), 2);
        assert_eq!(h.ledger.snapshot(p1), Some((8, 2)));

        let sent = h.publisher.published_to(PAYMENT_REQUESTS_TOPIC);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, order_id.to_string());
        let request: PaymentRequest = serde_json::from_str(&sent[0].payload).unwrap();
        assert_eq!(request.amount, 500);
        assert_eq!(request.currency, "usd");
        assert_eq!(request.idempotency_key.as_deref(), Some("K1"));

        let outbox = h.store.outbox();
        assert_eq!(outbox.len(), 1);
        assert!(outbox[0].1, "outbox row should be marked processed");
    }

    #[tokio::test]
    async fn same_idempotency_key_creates_one_order() {
        let p1 = Uuid::new_v4();
        let h = harness(FixedCatalog::new().with_price(p1, 100), ReservationPolicy::Required);
        h.ledger.set_stock(p1, 10, 0);

        h.consumer
            .handle(&checkout(Uuid::new_v4(), Some("K1"), &[(p1, 1)]))
            .await
            .unwrap();
        h.consumer
            .handle(&checkout(Uuid::new_v4(), Some("K1"), &[(p1, 1)]))
            .await
            .unwrap();

        assert_eq!(h.store.order_count(), 1);
        assert_eq!(h.publisher.published_to(PAYMENT_REQUESTS_TOPIC).len(), 1);
        assert_eq!(h.ledger.snapshot(p1), Some((9, 1)));
    }

    #[tokio::test]
    async fn redelivered_checkout_is_acknowledged_without_side_effects() {
        let p1 = Uuid::new_v4();
        let h = harness(FixedCatalog::new().with_price(p1, 100), ReservationPolicy::Required);
        h.ledger.set_stock(p1, 10, 0);
        let payload = checkout(Uuid::new_v4(), None, &[(p1, 3)]);

        h.consumer.handle(&payload).await.unwrap();
        h.consumer.handle(&payload).await.unwrap();

        assert_eq!(h.store.order_count(), 1);
        assert_eq!(h.ledger.snapshot(p1), Some((7, 3)));
    }

    #[tokio::test]
    async fn malformed_checkout_is_dropped() {
        let h = harness(FixedCatalog::new(), ReservationPolicy::Required);

        let err = h.consumer.handle("{\"order_id\": 42").await.unwrap_err();

        assert_eq!(err.disposition(), Disposition::Ack);
        assert_eq!(h.store.order_count(), 0);
    }

    #[tokio::test]
    async fn checkout_without_orderable_items_is_dropped() {
        let (known, unknown) = (Uuid::new_v4(), Uuid::new_v4());
        let h = harness(FixedCatalog::new().with_price(known, 100), ReservationPolicy::Required);

        let err = h
            .consumer
            .handle(&checkout(Uuid::new_v4(), None, &[(known, 0), (unknown, 2)]))
            .await
            .unwrap_err();

        assert_eq!(err.disposition(), Disposition::Ack);
        assert_eq!(h.store.order_count(), 0);
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn unknown_products_are_skipped_from_the_order() {
        let (known, unknown) = (Uuid::new_v4(), Uuid::new_v4());
        let h = harness(FixedCatalog::new().with_price(known, 250), ReservationPolicy::Required);
        h.ledger.set_stock(known, 5, 0);
        let order_id = Uuid::new_v4();

        h.consumer
            .handle(&checkout(order_id, None, &[(known, 2), (unknown, 1)]))
            .await
            .unwrap();

        assert_eq!(h.store.order(order_id).unwrap().amount, 500);
        assert_eq!(h.store.items(order_id).len(), 1);
    }

    #[tokio::test]
    async fn required_policy_drops_checkout_on_shortfall() {
        let p1 = Uuid::new_v4();
        let h = harness(FixedCatalog::new().with_price(p1, 100), ReservationPolicy::Required);
        h.ledger.set_stock(p1, 1, 0);

        let err = h
            .consumer
            .handle(&checkout(Uuid::new_v4(), None, &[(p1, 2)]))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckoutError::InsufficientStock { .. }));
        assert_eq!(err.disposition(), Disposition::Ack);
        assert_eq!(h.store.order_count(), 0);
        assert_eq!(h.ledger.snapshot(p1), Some((1, 0)));
    }

    #[tokio::test]
    async fn best_effort_policy_creates_order_despite_shortfall() {
        let p1 = Uuid::new_v4();
        let h = harness(FixedCatalog::new().with_price(p1, 100), ReservationPolicy::BestEffort);
        h.ledger.set_stock(p1, 1, 0);
        let order_id = Uuid::new_v4();

        h.consumer
            .handle(&checkout(order_id, None, &[(p1, 2)]))
            .await
            .unwrap();

        assert_eq!(h.store.order(order_id).unwrap().amount, 200);
        assert_eq!(h.ledger.snapshot(p1), Some((1, 0)));
        assert_eq!(h.publisher.published_to(PAYMENT_REQUESTS_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn publish_failure_leaves_order_and_unprocessed_outbox_row() {
        let p1 = Uuid::new_v4();
        let h = harness(FixedCatalog::new().with_price(p1, 100), ReservationPolicy::Required);
        h.ledger.set_stock(p1, 5, 0);
        h.publisher.set_failing(true);
        let order_id = Uuid::new_v4();

        h.consumer
            .handle(&checkout(order_id, None, &[(p1, 1)]))
            .await
            .unwrap();

        assert!(h.store.order(order_id).is_some());
        let outbox = h.store.outbox();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].0.topic, PAYMENT_REQUESTS_TOPIC);
        assert!(!outbox[0].1);
    }

    #[tokio::test]
    async fn storage_and_catalog_outages_are_retried() {
        let p1 = Uuid::new_v4();
        let h = harness(FixedCatalog::new().with_price(p1, 100), ReservationPolicy::Required);
        h.ledger.set_stock(p1, 5, 0);
        let payload = checkout(Uuid::new_v4(), None, &[(p1, 1)]);

        h.catalog.set_unavailable(true);
        let err = h.consumer.handle(&payload).await.unwrap_err();
        assert_eq!(err.disposition(), Disposition::Retry);
        h.catalog.set_unavailable(false);

        h.store.set_failing(true);
        let err = h.consumer.handle(&payload).await.unwrap_err();
        assert_eq!(err.disposition(), Disposition::Retry);

        h.store.set_failing(false);
        h.consumer.handle(&payload).await.unwrap();
        assert_eq!(h.store.order_count(), 1);
    }

    #[tokio::test]
    async fn conflicting_order_number_keeps_the_hold_and_retries() {
        let p1 = Uuid::new_v4();
        let h = harness(FixedCatalog::new().with_price(p1, 100), ReservationPolicy::Required);
        h.ledger.set_stock(p1, 5, 0);
        let order_id = Uuid::new_v4();

        let squatter = NewOrder {
            id: Uuid::new_v4(),
            ..NewOrder::pending(order_id, Uuid::new_v4(), 100, None, Utc::now())
        };
        let squatter_message =
            NewOutboxEvent::new(squatter.id, PAYMENT_REQUESTS_TOPIC, "payment_request", &squatter.id).unwrap();
        h.store.create(squatter, Vec::new(), squatter_message).await.unwrap();

        let err = h
            .consumer
            .handle(&checkout(order_id, Some("K1"), &[(p1, 2)]))
            .await
            .unwrap_err();

        assert_eq!(err.disposition(), Disposition::Retry);
        assert!(h.store.order(order_id).is_none());
        assert_eq!(
            h.ledger.hold(order_id, p1),
            Some((2, shared::inventory::ReservationStatus::Reserved))
        );
        assert!(h.publisher.published_to(PAYMENT_REQUESTS_TOPIC).is_empty());
    }

    #[test]
    fn amount_overflow_is_rejected() {
        let items = [PricedItem {
            product_id: Uuid::new_v4(),
            quantity: 2,
            unit_price: i64::MAX,
        }];
        assert!(matches!(total_amount(&items), Err(CheckoutError::Validation(_))));
    }
}
