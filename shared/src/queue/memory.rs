use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, MessagePublisher, MessageSource, Receipt};

const POLL_STEP: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct StoredMessage {
    payload: String,
    visible_at: Instant,
    handle: u64,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    next_handle: u64,
    messages: BTreeMap<u64, StoredMessage>,
}

/// In-process queue with visibility-timeout semantics.
///
/// A received message is hidden for `visibility_timeout`; acking deletes it,
/// nacking or letting the timeout lapse makes it visible again. Receipts from
/// an earlier receive cannot ack a message that has since been redelivered.
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
        }
    }

    pub fn push(&self, payload: impl Into<String>) {
        {
            let mut state = self.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.messages.insert(
                id,
                StoredMessage {
                    payload: payload.into(),
                    visible_at: Instant::now(),
                    handle: 0,
                    receive_count: 0,
                },
            );
        }
        self.notify.notify_waiters();
    }

    /// Messages not yet acked, visible or not.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn receive_counts(&self) -> Vec<u32> {
        self.lock().messages.values().map(|m| m.receive_count).collect()
    }

    fn take_visible(&self, max: usize) -> Vec<Delivery> {
        let now = Instant::now();
        let mut state = self.lock();
        let mut handle = state.next_handle;
        let mut deliveries = Vec::new();
        for (id, message) in state.messages.iter_mut() {
            if deliveries.len() >= max {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            handle += 1;
            message.handle = handle;
            message.visible_at = now + self.visibility_timeout;
            message.receive_count += 1;
            deliveries.push(Delivery {
                payload: message.payload.clone(),
                receipt: Receipt::Memory { id: *id, handle },
            });
        }
        state.next_handle = handle;
        deliveries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageSource for InMemoryQueue {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let deliveries = self.take_visible(max);
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(deliveries);
            }
            let step = (deadline - now).min(POLL_STEP);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(step) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let Receipt::Memory { id, handle } = delivery.receipt else {
            return Err(anyhow::anyhow!("Receipt {:?} does not belong to this queue", delivery.receipt));
        };
        let mut state = self.lock();
        if state.messages.get(&id).is_some_and(|m| m.handle == handle) {
            state.messages.remove(&id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let Receipt::Memory { id, handle } = delivery.receipt else {
            return Err(anyhow::anyhow!("Receipt {:?} does not belong to this queue", delivery.receipt));
        };
        {
            let mut state = self.lock();
            if let Some(message) = state.messages.get_mut(&id) {
                if message.handle == handle {
                    message.visible_at = Instant::now();
                }
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub payload: String,
}

/// Publisher that records messages instead of sending them.
#[derive(Clone, Default)]
pub struct InMemoryPublisher {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Failed to publish to {}: broker unavailable", topic));
        }
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(PublishedMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                payload: payload.to_string(),
            });
        Ok(())
    }
}
