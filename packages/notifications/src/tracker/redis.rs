//! Redis-backed delivery tracker.
//!
//! Storage schema:
//! - `deliveries:<id>` — JSON record, 7-day TTL
//! - `deliveries-by-event:<eventID>` — set of delivery IDs, same TTL
//! - `deliveries-by-subscription:<subID>` — set of delivery IDs, same TTL
//! - `deliveries-failed` — sorted set scored by completion millis
//!
//! Each `track` call is one MULTI/EXEC pipeline, so the record and all
//! index updates land atomically.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::DeliveryTracker;
use crate::error::Error;
use crate::model::{DeliveryStatus, NotificationDelivery};

/// Records expire after a week; the indices carry the same TTL.
const RECORD_TTL_SECS: u64 = 7 * 24 * 60 * 60;

const FAILED_INDEX_KEY: &str = "deliveries-failed";

pub struct RedisDeliveryTracker {
    conn: ConnectionManager,
}

impl RedisDeliveryTracker {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connect and build a tracker from a Redis URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self::new(conn))
    }

    fn record_key(id: &str) -> String {
        format!("deliveries:{id}")
    }

    fn event_index_key(event_id: &str) -> String {
        format!("deliveries-by-event:{event_id}")
    }

    fn subscription_index_key(subscription_id: &str) -> String {
        format!("deliveries-by-subscription:{subscription_id}")
    }

    /// Fetch records for a set of IDs, skipping ones whose TTL has expired.
    async fn fetch_all(&self, ids: Vec<String>) -> Result<Vec<NotificationDelivery>> {
        let mut conn = self.conn.clone();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn
                .get(Self::record_key(&id))
                .await
                .context("failed to fetch delivery record")?;
            if let Some(raw) = raw {
                records.push(
                    serde_json::from_str(&raw).context("failed to decode delivery record")?,
                );
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DeliveryTracker for RedisDeliveryTracker {
    async fn track(&self, delivery: &NotificationDelivery) -> Result<()> {
        let raw = serde_json::to_string(delivery).context("failed to encode delivery record")?;
        let record_key = Self::record_key(&delivery.id);
        let event_key = Self::event_index_key(&delivery.event_id);
        let subscription_key = Self::subscription_index_key(&delivery.subscription_id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set_ex(&record_key, raw, RECORD_TTL_SECS).ignore();
        pipe.sadd(&event_key, &delivery.id).ignore();
        pipe.expire(&event_key, RECORD_TTL_SECS as i64).ignore();
        pipe.sadd(&subscription_key, &delivery.id).ignore();
        pipe.expire(&subscription_key, RECORD_TTL_SECS as i64)
            .ignore();

        // ZADD on an existing member only updates its score, so re-tracking
        // the same failed delivery never duplicates the index entry.
        if delivery.status == DeliveryStatus::Failed {
            let score = delivery
                .completed_at
                .map(|t| t.timestamp_millis())
                .unwrap_or_default();
            pipe.zadd(FAILED_INDEX_KEY, &delivery.id, score).ignore();
        } else {
            pipe.zrem(FAILED_INDEX_KEY, &delivery.id).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("failed to persist delivery record")?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<NotificationDelivery> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(Self::record_key(id))
            .await
            .context("failed to fetch delivery record")?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).context("failed to decode delivery record"),
            None => Err(anyhow!(Error::NotFound { id: id.to_string() })),
        }
    }

    async fn list_by_event(&self, event_id: &str) -> Result<Vec<NotificationDelivery>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(Self::event_index_key(event_id))
            .await
            .context("failed to read by-event index")?;
        self.fetch_all(ids).await
    }

    async fn list_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<NotificationDelivery>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(Self::subscription_index_key(subscription_id))
            .await
            .context("failed to read by-subscription index")?;
        self.fetch_all(ids).await
    }

    async fn list_failed(&self) -> Result<Vec<NotificationDelivery>> {
        let mut conn = self.conn.clone();
        // ZRANGE returns ascending score order: oldest failure first.
        let ids: Vec<String> = conn
            .zrange(FAILED_INDEX_KEY, 0, -1)
            .await
            .context("failed to read failed index")?;
        self.fetch_all(ids).await
    }
}
