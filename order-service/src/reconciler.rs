use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use shared::consumer::MessageHandler;
use shared::inventory::InventoryLedger;
use shared::{parse_message, CheckoutError, PaymentEvent, PaymentEventType};
use tracing::{debug, info, warn};

use crate::models::{PaymentOutcome, Transition};
use crate::store::OrderStore;

/// Applies `payment-events` to orders and settles their inventory holds.
///
/// Confirm and release run even when the order row was already up to date,
/// so a redelivery after a ledger failure still settles the stock.
pub struct OrderStatusReconciler {
    store: Arc<dyn OrderStore>,
    ledger: Arc<dyn InventoryLedger>,
}

impl OrderStatusReconciler {
    pub fn new(store: Arc<dyn OrderStore>, ledger: Arc<dyn InventoryLedger>) -> Self {
        Self { store, ledger }
    }
}

#[async_trait]
impl MessageHandler for OrderStatusReconciler {
    async fn handle(&self, payload: &str) -> Result<(), CheckoutError> {
        let event: PaymentEvent = parse_message(payload)?;
        let order_id = event.order_id;

        let outcome = match event.event_type {
            PaymentEventType::PaymentSucceeded => PaymentOutcome::Paid,
            PaymentEventType::PaymentFailed | PaymentEventType::CheckoutSessionFailed => PaymentOutcome::Failed,
            PaymentEventType::CheckoutSessionCreated | PaymentEventType::Unknown => {
                debug!(%order_id, event_type = event.event_type.as_str(), "Ignoring payment event");
                return Ok(());
            }
        };

        let Some((transition, items)) = self
            .store
            .apply_payment_outcome(order_id, outcome, Utc::now())
            .await?
        else {
            warn!(%order_id, event_type = event.event_type.as_str(), "Payment event for unknown order");
            counter!("orders_unknown_payment_events_total").increment(1);
            return Ok(());
        };

        match &transition {
            Transition::Refused { current } => {
                warn!(%order_id, current = %current, event_type = event.event_type.as_str(), "Refusing to move a settled order");
                counter!("orders_refused_transitions_total").increment(1);
                return Ok(());
            }
            Transition::Applied { status, .. } => {
                info!(%order_id, status = status.as_str(), "Order status updated");
            }
            Transition::Backfilled { status, .. } => {
                info!(%order_id, status = status.as_str(), "Order timestamp backfilled");
            }
            Transition::Unchanged => {
                debug!(%order_id, "Order already reflects payment outcome");
            }
        }

        match outcome {
            PaymentOutcome::Paid => self.ledger.confirm(order_id, &items).await?,
            PaymentOutcome::Failed => self.ledger.release(order_id, &items).await?,
        }

        Ok(())
    }
}
