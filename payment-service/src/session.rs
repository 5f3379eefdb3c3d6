use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use shared::consumer::MessageHandler;
use shared::queue::MessagePublisher;
use shared::{parse_message, CheckoutError, PaymentEventType, PaymentRequest};
use tracing::{error, info, warn};

use crate::events::{emit, outbox_message};
use crate::models::PaymentStatus;
use crate::provider::{PaymentProvider, ProviderError, SessionRequest};
use crate::store::{AttachOutcome, FinalizeOutcome, PaymentStore};

/// Consumes `payment-requests` and opens one hosted checkout session per order.
pub struct PaymentSessionConsumer {
    store: Arc<dyn PaymentStore>,
    provider: Arc<dyn PaymentProvider>,
    publisher: Arc<dyn MessagePublisher>,
}

impl PaymentSessionConsumer {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        provider: Arc<dyn PaymentProvider>,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            store,
            provider,
            publisher,
        }
    }
}

#[async_trait]
impl MessageHandler for PaymentSessionConsumer {
    async fn handle(&self, payload: &str) -> Result<(), CheckoutError> {
        let request: PaymentRequest = parse_message(payload)?;
        let order_id = request.order_id;

        let payment = match self.store.find_by_order(order_id).await? {
            Some(payment) => payment,
            None => self.store.create_pending(&request).await?,
        };

        if payment.is_terminal() {
            info!(%order_id, status = %payment.status, "Payment already settled");
            return Ok(());
        }
        if payment.has_session() {
            info!(%order_id, "Reusing existing checkout session");
            return Ok(());
        }

        let session_request = SessionRequest {
            order_id,
            user_id: payment.user_id,
            amount: payment.amount,
            currency: payment.currency.clone(),
            idempotency_key: request
                .idempotency_key
                .clone()
                .filter(|key| !key.trim().is_empty())
                .unwrap_or_else(|| order_id.to_string()),
        };

        let session = match self.provider.create_checkout_session(&session_request).await {
            Ok(session) => session,
            Err(ProviderError::Rejected { status, message }) => {
                warn!(%order_id, status, "Checkout session rejected: {}", message);
                counter!("payments_session_rejections_total").increment(1);

                let now = Utc::now();
                let message = outbox_message(&payment, PaymentEventType::CheckoutSessionFailed, now)?;
                if self.store.finalize(payment.id, PaymentStatus::Failed, now, message.clone()).await?
                    == FinalizeOutcome::Finalized
                {
                    emit(&*self.store, &*self.publisher, &message).await;
                }
                return Ok(());
            }
            Err(e) => return Err(CheckoutError::transient(e)),
        };

        let message = outbox_message(&payment, PaymentEventType::CheckoutSessionCreated, Utc::now())?;
        match self.store.attach_session(payment.id, &session, message.clone()).await? {
            AttachOutcome::Attached => {
                info!(%order_id, session_id = %session.id, "Checkout session created");
                counter!("payments_sessions_created_total").increment(1);
                emit(&*self.store, &*self.publisher, &message).await;
            }
            AttachOutcome::SessionConflict => {
                error!(%order_id, session_id = %session.id, "Session id already attached to another order, refusing to overwrite");
                counter!("payments_session_conflicts_total").increment(1);
            }
            AttachOutcome::AlreadyTerminal => {
                info!(%order_id, "Payment settled while session was being created");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payment;
    use crate::provider::{CheckoutSession, ScriptedProvider};
    use crate::store::InMemoryPaymentStore;
    use shared::queue::InMemoryPublisher;
    use shared::{Disposition, PaymentEvent, PAYMENT_EVENTS_TOPIC};
    use uuid::Uuid;

    struct Harness {
        consumer: PaymentSessionConsumer,
        store: InMemoryPaymentStore,
        provider: ScriptedProvider,
        publisher: InMemoryPublisher,
    }

    fn harness() -> Harness {
        let store = InMemoryPaymentStore::new();
        let provider = ScriptedProvider::new();
        let publisher = InMemoryPublisher::new();
        Harness {
            consumer: PaymentSessionConsumer::new(
                Arc::new(store.clone()),
                Arc::new(provider.clone()),
                Arc::new(publisher.clone()),
            ),
            store,
            provider,
            publisher,
        }
    }

    fn request(order_id: Uuid, key: Option<&str>) -> String {
        serde_json::to_string(&PaymentRequest {
            order_id,
            user_id: Uuid::new_v4(),
            amount: 500,
            currency: "usd".into(),
            idempotency_key: key.map(str::to_string),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn creates_session_and_announces_it() {
        let h = harness();
        let order_id = Uuid::new_v4();

        h.consumer.handle(&request(order_id, Some("K1"))).await.unwrap();

        let payment = h.store.payment(order_id).unwrap();
        assert_eq!(payment.status, "URL_READY");
        assert!(payment.has_session());
        assert_eq!(h.provider.requests()[0].idempotency_key, "K1");
        assert_eq!(h.provider.requests()[0].amount, 500);

        let sent = h.publisher.published_to(PAYMENT_EVENTS_TOPIC);
        assert_eq!(sent.len(), 1);
        let event: PaymentEvent = serde_json::from_str(&sent[0].payload).unwrap();
        assert_eq!(event.event_type, PaymentEventType::CheckoutSessionCreated);
        assert_eq!(event.payment_id, Some(payment.id));
        assert!(h.store.outbox()[0].1);
    }

    #[tokio::test]
    async fn redelivery_reuses_the_session() {
        let h = harness();
        let order_id = Uuid::new_v4();
        let payload = request(order_id, None);

        h.consumer.handle(&payload).await.unwrap();
        h.consumer.handle(&payload).await.unwrap();

        assert_eq!(h.provider.requests().len(), 1);
        assert_eq!(h.provider.requests()[0].idempotency_key, order_id.to_string());
        assert_eq!(h.publisher.published_to(PAYMENT_EVENTS_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn session_owned_by_another_order_is_not_overwritten() {
        let h = harness();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let shared_session = CheckoutSession {
            id: "cs_shared".into(),
            url: "https://checkout.example/c/shared".into(),
        };
        h.provider.push(Ok(shared_session.clone()));
        h.provider.push(Ok(shared_session));

        h.consumer.handle(&request(first, None)).await.unwrap();
        h.consumer.handle(&request(second, None)).await.unwrap();

        assert_eq!(
            h.store.payment(first).unwrap().external_session_id.as_deref(),
            Some("cs_shared")
        );
        let second_payment = h.store.payment(second).unwrap();
        assert_eq!(second_payment.external_session_id, None);
        assert_eq!(second_payment.status, "PENDING");
    }

    #[tokio::test]
    async fn rejected_request_fails_the_payment() {
        let h = harness();
        let order_id = Uuid::new_v4();
        h.provider.push(Err(ProviderError::Rejected {
            status: 400,
            message: "amount too small".into(),
        }));

        h.consumer.handle(&request(order_id, None)).await.unwrap();

        let payment = h.store.payment(order_id).unwrap();
        assert_eq!(payment.status, "failed");
        assert!(payment.failed_at.is_some());
        let event: PaymentEvent =
            serde_json::from_str(&h.publisher.published_to(PAYMENT_EVENTS_TOPIC)[0].payload).unwrap();
        assert_eq!(event.event_type, PaymentEventType::CheckoutSessionFailed);
    }

    #[tokio::test]
    async fn provider_outage_is_retried() {
        let h = harness();
        let order_id = Uuid::new_v4();
        h.provider
            .push(Err(ProviderError::Unavailable("503 from provider".into())));

        let err = h.consumer.handle(&request(order_id, None)).await.unwrap_err();

        assert_eq!(err.disposition(), Disposition::Retry);
        assert_eq!(h.store.payment(order_id).unwrap().status, "PENDING");

        h.consumer.handle(&request(order_id, None)).await.unwrap();
        assert_eq!(h.store.payment(order_id).unwrap().status, "URL_READY");
    }

    #[tokio::test]
    async fn settled_payment_is_left_alone() {
        let h = harness();
        let order_id = Uuid::new_v4();
        let now = Utc::now();
        h.store.insert(Payment {
            id: Uuid::new_v4(),
            order_id,
            user_id: Uuid::new_v4(),
            amount: 500,
            currency: "usd".into(),
            status: "succeeded".into(),
            external_session_id: Some("cs_done".into()),
            checkout_url: None,
            succeeded_at: Some(now),
            failed_at: None,
            created_at: now,
            updated_at: now,
        });

        h.consumer.handle(&request(order_id, None)).await.unwrap();

        assert!(h.provider.requests().is_empty());
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn malformed_request_is_dropped() {
        let h = harness();
        let err = h.consumer.handle("not json").await.unwrap_err();
        assert_eq!(err.disposition(), Disposition::Ack);
    }
}
