use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Delivery, MessagePublisher, MessageSource, Receipt};

/// How long a partially filled batch keeps collecting once the first
/// message has arrived.
const BATCH_LINGER: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct PartitionState {
    in_flight: BTreeSet<i64>,
    completed_high: Option<i64>,
    rewound_to: Option<i64>,
    stored: i64,
}

impl PartitionState {
    /// Next offset that is safe to commit: nothing below it is still in
    /// flight or waiting for redelivery.
    fn watermark(&self) -> Option<i64> {
        let mut next = match self.in_flight.iter().next() {
            Some(lowest) => *lowest,
            None => self.completed_high? + 1,
        };
        if let Some(rewound) = self.rewound_to {
            next = next.min(rewound);
        }
        Some(next)
    }

    /// Registers a received offset. Returns false for messages prefetched
    /// before a rewind, which will be consumed again after the seek.
    fn admit(&mut self, offset: i64) -> bool {
        if let Some(rewound) = self.rewound_to {
            if offset > rewound {
                return false;
            }
            self.rewound_to = None;
        }
        self.in_flight.insert(offset);
        true
    }

    /// Marks `offset` for redelivery and returns the previous rewind point.
    fn rewind(&mut self, offset: i64) -> Option<i64> {
        self.in_flight.remove(&offset);
        let previous = self.rewound_to;
        self.rewound_to = Some(previous.map_or(offset, |r| r.min(offset)));
        previous
    }

    /// Undoes a rewind whose seek failed. The offset stays held so nothing
    /// past it is stored; it comes back after the next rebalance or restart.
    fn abandon_rewind(&mut self, offset: i64, previous: Option<i64>) {
        self.rewound_to = previous;
        self.in_flight.insert(offset);
    }
}

type PartitionMap = Arc<Mutex<HashMap<(String, i32), PartitionState>>>;

fn lock_partitions(partitions: &PartitionMap) -> MutexGuard<'_, HashMap<(String, i32), PartitionState>> {
    partitions
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops offset bookkeeping for partitions whose ownership changes, so a
/// reassigned partition starts again from its committed offset.
struct RebalanceContext {
    partitions: PartitionMap,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        let tpl = match rebalance {
            Rebalance::Assign(tpl) | Rebalance::Revoke(tpl) => tpl,
            _ => return,
        };
        let mut partitions = lock_partitions(&self.partitions);
        for elem in tpl.elements() {
            if partitions
                .remove(&(elem.topic().to_string(), elem.partition()))
                .is_some()
            {
                debug!(topic = elem.topic(), partition = elem.partition(), "Reset partition state on rebalance");
            }
        }
    }
}

/// Kafka-backed source with manual offset storage.
///
/// Offsets are stored only after a successful ack, and never past a message
/// that was nacked. A nack seeks the partition back so the message (and
/// anything after it) is consumed again.
pub struct KafkaSource {
    consumer: StreamConsumer<RebalanceContext>,
    partitions: PartitionMap,
    redelivery_delay: Duration,
}

impl KafkaSource {
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> Result<Self> {
        let partitions = PartitionMap::default();
        let consumer: StreamConsumer<RebalanceContext> = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create_with_context(RebalanceContext {
                partitions: partitions.clone(),
            })?;
        consumer.subscribe(&[topic])?;

        Ok(Self {
            consumer,
            partitions,
            redelivery_delay: Duration::from_secs(5),
        })
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    fn track(&self, topic: &str, partition: i32, offset: i64) -> bool {
        self.lock()
            .entry((topic.to_string(), partition))
            .or_default()
            .admit(offset)
    }

    fn complete(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let to_store = {
            let mut partitions = self.lock();
            let state = partitions
                .entry((topic.to_string(), partition))
                .or_default();
            state.in_flight.remove(&offset);
            state.completed_high = Some(state.completed_high.map_or(offset, |h| h.max(offset)));
            match state.watermark() {
                Some(next) if next > state.stored => {
                    state.stored = next;
                    Some(next)
                }
                _ => None,
            }
        };

        if let Some(next) = to_store {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(topic, partition, Offset::Offset(next))?;
            self.consumer.store_offsets(&tpl)?;
        }
        Ok(())
    }
    fn lock(&self) -> MutexGuard<'_, HashMap<(String, i32), PartitionState>> {
        lock_partitions(&self.partitions)
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let mut deadline = Instant::now() + wait;
        let mut deliveries = Vec::new();

        while deliveries.len() < max {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (topic, partition, offset, payload) =
                match tokio::time::timeout(deadline - now, self.consumer.recv()).await {
                    Err(_) => break,
                    Ok(Err(e)) if deliveries.is_empty() => return Err(e.into()),
                    Ok(Err(e)) => {
                        warn!("Error receiving message: {}", e);
                        break;
                    }
                    Ok(Ok(m)) => {
                        let payload = match m.payload_view::<str>() {
                            Some(Ok(json_str)) => Some(json_str.to_string()),
                            Some(Err(e)) => {
                                warn!("Error parsing payload: {}", e);
                                None
                            }
                            None => None,
                        };
                        (m.topic().to_string(), m.partition(), m.offset(), payload)
                    }
                };

            if !self.track(&topic, partition, offset) {
                debug!(topic = %topic, partition, offset, "Skipping message prefetched before rewind");
                continue;
            }

            match payload {
                Some(payload) => deliveries.push(Delivery {
                    payload,
                    receipt: Receipt::Kafka {
                        topic,
                        partition,
                        offset,
                    },
                }),
                None => {
                    warn!(topic = %topic, partition, offset, "Dropping message without a UTF-8 payload");
                    self.complete(&topic, partition, offset)?;
                }
            }

            deadline = deadline.min(Instant::now() + BATCH_LINGER);
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        match &delivery.receipt {
            Receipt::Kafka {
                topic,
                partition,
                offset,
            } => self.complete(topic, *partition, *offset),
            other => Err(anyhow::anyhow!("Receipt {:?} does not belong to Kafka", other)),
        }
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let Receipt::Kafka {
            topic,
            partition,
            offset,
        } = &delivery.receipt
        else {
            return Err(anyhow::anyhow!("Receipt {:?} does not belong to Kafka", delivery.receipt));
        };

        let previous = self
            .lock()
            .entry((topic.clone(), *partition))
            .or_default()
            .rewind(*offset);

        tokio::time::sleep(self.redelivery_delay).await;
        if let Err(e) = self
            .consumer
            .seek(topic, *partition, Offset::Offset(*offset), Duration::from_secs(5))
        {
            warn!(topic = %topic, partition, offset, "Seek for redelivery failed, holding offset: {}", e);
            if let Some(state) = self.lock().get_mut(&(topic.clone(), *partition)) {
                state.abandon_rewind(*offset, previous);
            }
            return Err(e).context(format!("seek {}/{} to {}", topic, partition, offset));
        }
        Ok(())
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        let record = FutureRecord::to(topic).payload(payload).key(key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish to {}: {}", topic, e))?;

        Ok(())
    }
}
