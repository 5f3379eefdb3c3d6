use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

/// Stores finished checkout responses, serialized, keyed per user and
/// idempotency key.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, body: &str, ttl: Duration) -> Result<()>;
}

pub fn checkout_key(user_id: uuid::Uuid, idempotency_key: &str) -> String {
    format!("checkout:{}:{}", user_id, idempotency_key)
}

#[derive(Default)]
pub struct InMemoryResponseCache {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, body: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        // Keys are rarely read twice, so expired entries are dropped here.
        self.entries.retain(|_, (_, expires)| *expires > now);
        self.entries
            .insert(key.to_string(), (body.to_string(), now + ttl));
        Ok(())
    }
}

pub struct RedisResponseCache {
    connection: ConnectionManager,
}

impl RedisResponseCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl ResponseCache for RedisResponseCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let body: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(body)
    }

    async fn put(&self, key: &str, body: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(body)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
