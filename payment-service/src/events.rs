use chrono::{DateTime, Utc};
use shared::outbox::{self, NewOutboxEvent};
use shared::queue::MessagePublisher;
use shared::{CheckoutError, PaymentEventType, PAYMENT_EVENTS_TOPIC};
use tracing::warn;

use crate::models::Payment;
use crate::store::PaymentStore;

pub fn outbox_message(
    payment: &Payment,
    event_type: PaymentEventType,
    at: DateTime<Utc>,
) -> Result<NewOutboxEvent, CheckoutError> {
    let event = payment.event(event_type, at);
    Ok(NewOutboxEvent::new(
        payment.order_id,
        PAYMENT_EVENTS_TOPIC,
        event_type.as_str(),
        &event,
    )?)
}

/// Publishes a committed outbox row right away. Failures are left to the
/// outbox sweep.
pub async fn emit(store: &dyn PaymentStore, publisher: &dyn MessagePublisher, message: &NewOutboxEvent) {
    match outbox::publish(publisher, &message.topic, message.aggregate_id, &message.payload).await {
        Ok(()) => {
            if let Err(e) = store.mark_published(message.id).await {
                warn!(order_id = %message.aggregate_id, "Event sent but outbox row not marked: {}", e);
            }
        }
        Err(e) => {
            warn!(
                order_id = %message.aggregate_id,
                event_type = %message.event_type,
                "Event left for outbox retry: {:#}",
                e
            );
        }
    }
}
