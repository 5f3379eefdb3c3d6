//! Queue abstraction used by every consumer.
//!
//! Delivery is at-least-once: a received message stays owned by the receiver
//! until it is acked, and comes back if it is nacked or left alone past the
//! visibility timeout.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

mod kafka;
mod memory;

pub use kafka::{KafkaPublisher, KafkaSource};
pub use memory::{InMemoryPublisher, InMemoryQueue, PublishedMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    Kafka {
        topic: String,
        partition: i32,
        offset: i64,
    },
    Memory {
        id: u64,
        handle: u64,
    },
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: String,
    pub receipt: Receipt,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Long-polls for up to `max` messages, waiting at most `wait` when the
    /// queue is empty.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Makes the message eligible for redelivery.
    async fn nack(&self, delivery: &Delivery) -> Result<()>;
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()>;
}
