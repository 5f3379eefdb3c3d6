//! Synchronous facade over the asynchronous checkout pipeline: start the
//! checkout, then wait a bounded time for the payment service to publish a
//! hosted checkout URL.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use shared::context::RequestContext;
use shared::tasks::BackgroundTasks;
use shared::PaymentStatusView;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{checkout_key, ResponseCache};
use crate::clients::{CartService, PaymentStatusSource};

pub const PENDING_PAYMENT: &str = "PENDING_PAYMENT";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Idempotency-Key header is required")]
    MissingIdempotencyKey,
    #[error("cart is empty")]
    EmptyCart,
    #[error("upstream failure: {0:#}")]
    Upstream(#[from] anyhow::Error),
    #[error("response encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub poll_deadline: Duration,
    pub cache_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(700),
            poll_deadline: Duration::from_secs(15),
            cache_ttl: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutReady {
    pub order_id: Uuid,
    pub session_id: Option<String>,
    pub checkout_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutPending {
    pub order_id: Uuid,
    pub status: String,
    pub checkout_url: Option<String>,
    pub poll_url: String,
}

impl CheckoutPending {
    pub fn new(order_id: Uuid) -> Self {
        Self {
            order_id,
            status: PENDING_PAYMENT.to_string(),
            checkout_url: None,
            poll_url: format!("/payment/status/by-order/{}", order_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// Serialized body of an earlier successful checkout with the same key.
    Cached(String),
    /// Serialized [`CheckoutReady`].
    Ready(String),
    Pending(CheckoutPending),
}

pub struct CheckoutOrchestrator {
    cart: Arc<dyn CartService>,
    payments: Arc<dyn PaymentStatusSource>,
    cache: Arc<dyn ResponseCache>,
    tasks: BackgroundTasks,
    config: OrchestratorConfig,
}

impl CheckoutOrchestrator {
    pub fn new(
        cart: Arc<dyn CartService>,
        payments: Arc<dyn PaymentStatusSource>,
        cache: Arc<dyn ResponseCache>,
        tasks: BackgroundTasks,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            cart,
            payments,
            cache,
            tasks,
            config,
        }
    }

    pub async fn checkout(&self, ctx: &RequestContext, idempotency_key: &str) -> Result<CheckoutOutcome, GatewayError> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Err(GatewayError::MissingIdempotencyKey);
        }
        let cache_key = checkout_key(ctx.user_id, key);

        match self.cache.get(&cache_key).await {
            Ok(Some(body)) => {
                debug!(user_id = %ctx.user_id, "Serving cached checkout response");
                counter!("gateway_checkout_cache_hits_total").increment(1);
                return Ok(CheckoutOutcome::Cached(body));
            }
            Ok(None) => {}
            Err(e) => warn!("Checkout cache lookup failed, continuing uncached: {:#}", e),
        }

        if self.cart.item_count(ctx).await? == 0 {
            return Err(GatewayError::EmptyCart);
        }

        let order_id = self.cart.trigger_checkout(ctx, key).await?;
        info!(user_id = %ctx.user_id, %order_id, "Checkout started");

        let Some(view) = self.await_checkout_url(order_id).await else {
            info!(%order_id, "Checkout URL not ready before deadline");
            counter!("gateway_checkout_pending_total").increment(1);
            return Ok(CheckoutOutcome::Pending(CheckoutPending::new(order_id)));
        };

        let ready = CheckoutReady {
            order_id,
            session_id: view.session_id,
            checkout_url: view.checkout_url.unwrap_or_default(),
        };
        let body = serde_json::to_string(&ready)?;

        let cache = self.cache.clone();
        let ttl = self.config.cache_ttl;
        let cached_body = body.clone();
        self.tasks.spawn("checkout-cache-write", async move {
            cache.put(&cache_key, &cached_body, ttl).await
        });

        Ok(CheckoutOutcome::Ready(body))
    }

    /// Polls until the payment status carries a checkout URL. Returns `None`
    /// once the deadline passes; never runs past it.
    async fn await_checkout_url(&self, order_id: Uuid) -> Option<PaymentStatusView> {
        let deadline = Instant::now() + self.config.poll_deadline;
        let poll = async {
            loop {
                match self.payments.status(order_id).await {
                    Ok(view) if view.is_ready() => return view,
                    Ok(view) => debug!(%order_id, status = %view.status, "Checkout URL not ready"),
                    Err(e) => warn!(%order_id, "Payment status poll failed: {:#}", e),
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };
        tokio::time::timeout_at(deadline, poll).await.ok()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::InMemoryResponseCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakeCart {
        pub items: usize,
        pub order_id: Uuid,
        pub checkouts: AtomicUsize,
    }

    #[async_trait]
    impl CartService for FakeCart {
        async fn item_count(&self, _ctx: &RequestContext) -> anyhow::Result<usize> {
            Ok(self.items)
        }

        async fn trigger_checkout(&self, _ctx: &RequestContext, _key: &str) -> anyhow::Result<Uuid> {
            self.checkouts.fetch_add(1, Ordering::SeqCst);
            Ok(self.order_id)
        }
    }

    /// Reports PENDING until `ready_on` polls have been made; the first
    /// `errors` polls fail.
    #[derive(Default)]
    pub struct ScriptedPayments {
        pub ready_on: Option<usize>,
        pub errors: usize,
        pub polls: AtomicUsize,
    }

    #[async_trait]
    impl PaymentStatusSource for ScriptedPayments {
        async fn status(&self, order_id: Uuid) -> anyhow::Result<PaymentStatusView> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if poll <= self.errors {
                anyhow::bail!("payment service unavailable");
            }
            let mut view = PaymentStatusView::pending(order_id);
            if self.ready_on.is_some_and(|n| poll >= n) {
                view.status = "URL_READY".into();
                view.session_id = Some("cs_1".into());
                view.checkout_url = Some("https://checkout.example/c/cs_1".into());
            }
            Ok(view)
        }
    }

    pub fn ctx() -> RequestContext {
        RequestContext {
            user_id: Uuid::new_v4(),
            role: "customer".into(),
            email: None,
        }
    }

    pub fn orchestrator(
        cart: Arc<FakeCart>,
        payments: Arc<ScriptedPayments>,
        tasks: BackgroundTasks,
    ) -> CheckoutOrchestrator {
        CheckoutOrchestrator::new(
            cart,
            payments,
            Arc::new(InMemoryResponseCache::new()),
            tasks,
            OrchestratorConfig::default(),
        )
    }

    fn cart(items: usize) -> Arc<FakeCart> {
        Arc::new(FakeCart {
            items,
            order_id: Uuid::new_v4(),
            ..FakeCart::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn returns_checkout_url_once_ready() {
        let cart = cart(2);
        let payments = Arc::new(ScriptedPayments {
            ready_on: Some(3),
            errors: 1,
            ..ScriptedPayments::default()
        });
        let gateway = orchestrator(cart.clone(), payments.clone(), BackgroundTasks::new(4, Duration::from_secs(1)));

        let outcome = gateway.checkout(&ctx(), "K1").await.unwrap();

        let CheckoutOutcome::Ready(body) = outcome else {
            panic!("expected ready outcome, got {:?}", outcome);
        };
        let ready: CheckoutReady = serde_json::from_str(&body).unwrap();
        assert_eq!(ready.order_id, cart.order_id);
        assert_eq!(ready.session_id.as_deref(), Some("cs_1"));
        assert_eq!(ready.checkout_url, "https://checkout.example/c/cs_1");
        assert_eq!(payments.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_with_pending_after_deadline() {
        let cart = cart(1);
        let payments = Arc::new(ScriptedPayments::default());
        let gateway = orchestrator(cart.clone(), payments.clone(), BackgroundTasks::new(4, Duration::from_secs(1)));
        let config = OrchestratorConfig::default();

        let started = Instant::now();
        let outcome = gateway.checkout(&ctx(), "K1").await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome, CheckoutOutcome::Pending(CheckoutPending::new(cart.order_id)));
        assert!(elapsed >= config.poll_deadline);
        assert!(elapsed <= config.poll_deadline + config.poll_interval);
        assert!(payments.polls.load(Ordering::SeqCst) >= 20);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_key_is_served_from_cache() {
        let cart = cart(1);
        let payments = Arc::new(ScriptedPayments {
            ready_on: Some(1),
            ..ScriptedPayments::default()
        });
        let tasks = BackgroundTasks::new(4, Duration::from_secs(1));
        let gateway = orchestrator(cart.clone(), payments, tasks.clone());
        let caller = ctx();

        let CheckoutOutcome::Ready(first) = gateway.checkout(&caller, "K1").await.unwrap() else {
            panic!("expected ready outcome");
        };
        tasks.shutdown(Duration::from_secs(1)).await;

        let second = gateway.checkout(&caller, "K1").await.unwrap();
        assert_eq!(second, CheckoutOutcome::Cached(first));
        assert_eq!(cart.checkouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_cart_and_blank_key_are_rejected() {
        let gateway = orchestrator(
            cart(0),
            Arc::new(ScriptedPayments::default()),
            BackgroundTasks::new(4, Duration::from_secs(1)),
        );

        assert!(matches!(
            gateway.checkout(&ctx(), "K1").await,
            Err(GatewayError::EmptyCart)
        ));
        assert!(matches!(
            gateway.checkout(&ctx(), "  ").await,
            Err(GatewayError::MissingIdempotencyKey)
        ));
    }
}
