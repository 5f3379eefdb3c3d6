//! Transactional outbox.
//!
//! Services write the message they owe downstream into `outbox_events` in the
//! same transaction as the state change, try to publish it right away, and
//! leave anything that failed to the [`OutboxProcessor`] sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::queue::MessagePublisher;

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        topic -> Varchar,
        event_type -> Varchar,
        payload -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = outbox_events)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub topic: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub topic: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    pub fn new<T: Serialize>(
        aggregate_id: Uuid,
        topic: &str,
        event_type: &str,
        message: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id,
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            payload: serde_json::to_value(message)?,
        })
    }
}

pub async fn insert(conn: &mut AsyncPgConnection, event: &NewOutboxEvent) -> QueryResult<()> {
    diesel::insert_into(outbox_events::table)
        .values(event)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn mark_processed(conn: &mut AsyncPgConnection, id: Uuid) -> QueryResult<()> {
    diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
        .set(outbox_events::processed.eq(true))
        .execute(conn)
        .await?;
    Ok(())
}

/// Publishes one outbox message keyed by its aggregate.
pub async fn publish(
    publisher: &dyn MessagePublisher,
    topic: &str,
    aggregate_id: Uuid,
    payload: &serde_json::Value,
) -> Result<()> {
    let json = serde_json::to_string(payload)?;
    publisher
        .publish(topic, &aggregate_id.to_string(), &json)
        .await
}

pub struct OutboxProcessor {
    pool: DbPool,
    publisher: Arc<dyn MessagePublisher>,
    interval: Duration,
}

impl OutboxProcessor {
    pub fn new(pool: DbPool, publisher: Arc<dyn MessagePublisher>, interval: Duration) -> Self {
        Self {
            pool,
            publisher,
            interval,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {:#}", e);
            }
        }
        info!("Outbox processor stopped");
    }

    async fn process_outbox_events(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let unprocessed_events = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(100)
            .select(OutboxEvent::as_select())
            .load::<OutboxEvent>(&mut conn)
            .await?;

        for event in unprocessed_events {
            if let Err(e) = publish(&*self.publisher, &event.topic, event.aggregate_id, &event.payload).await {
                warn!(event_id = %event.id, "Failed to publish outbox event: {:#}", e);
                continue;
            }

            mark_processed(&mut conn, event.id).await?;

            info!(event_id = %event.id, event_type = %event.event_type, "Published outbox event");
        }

        Ok(())
    }
}
