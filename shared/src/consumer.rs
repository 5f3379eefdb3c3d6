use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CheckoutError, Disposition};
use crate::queue::{Delivery, MessageSource};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &str) -> Result<(), CheckoutError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub wait: Duration,
    pub max_in_flight: usize,
    pub receive_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait: Duration::from_secs(20),
            max_in_flight: 4,
            receive_backoff: Duration::from_secs(1),
        }
    }
}

/// Polls `source` until `shutdown` is cancelled.
///
/// Messages are acked only when the handler succeeds or fails with an error
/// that redelivery cannot fix; everything else is nacked and comes back
/// after the visibility timeout. Once shutdown starts, deliveries that have
/// not started are handed back to the queue.
pub async fn run_consumer<S, H>(
    name: &'static str,
    source: Arc<S>,
    handler: Arc<H>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
) where
    S: MessageSource + ?Sized,
    H: MessageHandler + ?Sized,
{
    info!(consumer = name, "Consumer started");

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = source.receive(config.batch_size, config.wait) => received,
        };

        let deliveries = match received {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(consumer = name, "Error receiving messages: {:#}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.receive_backoff) => continue,
                }
            }
        };

        futures::stream::iter(deliveries)
            .for_each_concurrent(config.max_in_flight.max(1), |delivery| {
                let source = source.clone();
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                async move {
                    if shutdown.is_cancelled() {
                        release(name, &*source, &delivery).await;
                        return;
                    }
                    process(name, &*source, &*handler, &delivery).await;
                }
            })
            .await;
    }

    info!(consumer = name, "Consumer stopped");
}

async fn process<S, H>(name: &'static str, source: &S, handler: &H, delivery: &Delivery)
where
    S: MessageSource + ?Sized,
    H: MessageHandler + ?Sized,
{
    let outcome = handler.handle(&delivery.payload).await;

    let disposition = match &outcome {
        Ok(()) => Disposition::Ack,
        Err(err) => err.disposition(),
    };

    match (&outcome, disposition) {
        (Ok(()), _) => debug!(consumer = name, "Message handled"),
        (Err(err), Disposition::Ack) => {
            warn!(consumer = name, error = %err, "Dropping message");
            metrics::counter!("consumer_messages_dropped_total", "consumer" => name).increment(1);
        }
        (Err(err), Disposition::Retry) => {
            warn!(consumer = name, error = %err, "Message will be redelivered");
            metrics::counter!("consumer_messages_retried_total", "consumer" => name).increment(1);
        }
    }

    match disposition {
        Disposition::Ack => {
            if let Err(e) = source.ack(delivery).await {
                error!(consumer = name, "Error acknowledging message: {:#}", e);
            }
        }
        Disposition::Retry => release(name, source, delivery).await,
    }
}

async fn release<S>(name: &'static str, source: &S, delivery: &Delivery)
where
    S: MessageSource + ?Sized,
{
    if let Err(e) = source.nack(delivery).await {
        error!(consumer = name, "Error releasing message: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedHandler {
        calls: AtomicUsize,
        fail_first: usize,
        error: fn() -> CheckoutError,
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, _payload: &str) -> Result<(), CheckoutError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err((self.error)());
            }
            Ok(())
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            batch_size: 10,
            wait: Duration::from_millis(100),
            max_in_flight: 2,
            receive_backoff: Duration::from_millis(10),
        }
    }

    async fn run_until_drained(queue: Arc<InMemoryQueue>, handler: Arc<ScriptedHandler>) {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_consumer(
            "test",
            queue.clone(),
            handler,
            config(),
            shutdown.clone(),
        ));
        for _ in 0..200 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_redelivered_then_acked() {
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(1)));
        queue.push("m1");
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
            fail_first: 2,
            error: || CheckoutError::transient(anyhow::anyhow!("db down")),
        });

        run_until_drained(queue.clone(), handler.clone()).await;

        assert!(queue.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_failures_are_acked_without_retry() {
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(1)));
        queue.push("{broken");
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            error: || CheckoutError::Validation("broken".into()),
        });

        run_until_drained(queue.clone(), handler.clone()).await;

        assert!(queue.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_promptly_when_cancelled_while_idle() {
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(1)));
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            error: || CheckoutError::Validation("unused".into()),
        });
        let shutdown = CancellationToken::new();
        let mut cfg = config();
        cfg.wait = Duration::from_secs(3600);
        let task = tokio::spawn(run_consumer("idle", queue, handler, cfg, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("consumer did not stop")
            .unwrap();
    }
}
