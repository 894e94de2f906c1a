//! Redis Streams event queue.
//!
//! Wire format: one XADD entry per event, a single `event` field holding
//! the JSON-serialized `Event`, on a fixed well-known stream key.
//! Consumer groups are created lazily (`XGROUP CREATE ... MKSTREAM` at
//! position 0, BUSYGROUP tolerated); the read loop blocks with a bounded
//! timeout on XREADGROUP and never auto-acknowledges decodable entries.
//! Subscribing first drains the consumer's own pending-entries list
//! (XREADGROUP at id 0), so entries delivered before a crash are
//! redelivered when the consumer comes back under the same name.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{EventQueue, QueueEntry};
use crate::model::Event;

/// Well-known stream key for the shared event log.
pub const DEFAULT_STREAM_KEY: &str = "inventory:events";

/// The single entry field carrying the serialized event.
const EVENT_FIELD: &str = "event";

/// Bounded block timeout for XREADGROUP, so read loops observe shutdown.
const READ_BLOCK_MS: usize = 5_000;

/// Entries fetched per XREADGROUP call.
const READ_BATCH: usize = 16;

pub struct RedisEventQueue {
    conn: ConnectionManager,
    stream: String,
    cancel: CancellationToken,
}

impl RedisEventQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_stream(conn, DEFAULT_STREAM_KEY)
    }

    /// Use a non-default stream key (integration tests isolate themselves
    /// this way).
    pub fn with_stream(conn: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            conn,
            stream: stream.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Connect and build a queue from a Redis URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self::new(conn))
    }

    /// Create the consumer group at the start of the log. An existing group
    /// is fine.
    async fn ensure_group(&self, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = conn
            .xgroup_create_mkstream(&self.stream, group, "0")
            .await;
        match created {
            Ok(_) => {
                debug!(stream = %self.stream, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e).context("failed to create consumer group"),
        }
    }

    /// Number of entries on the group's pending list. Used by tests and
    /// operational tooling.
    pub async fn pending_count(&self, group: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamPendingReply = conn
            .xpending(&self.stream, group)
            .await
            .context("failed to read pending entries")?;
        Ok(reply.count())
    }
}

#[async_trait]
impl EventQueue for RedisEventQueue {
    async fn publish(&self, event: &Event) -> Result<()> {
        let raw = serde_json::to_string(event).context("failed to serialize event")?;
        let mut conn = self.conn.clone();
        let _id: String = conn
            .xadd(&self.stream, "*", &[(EVENT_FIELD, raw.as_str())])
            .await
            .context("failed to append event to stream")?;
        Ok(())
    }

    async fn subscribe(&self, group: &str, consumer: &str) -> Result<mpsc::Receiver<QueueEntry>> {
        self.ensure_group(group).await?;

        let mut conn = self.conn.clone();
        let stream = self.stream.clone();
        let group = group.to_string();
        let consumer = consumer.to_string();
        let cancel = self.cancel.clone();

        let (tx, rx) = mpsc::channel(READ_BATCH);
        tokio::spawn(async move {
            // Entries delivered to this consumer before a crash sit on its
            // pending list and are never returned by a `>` read. Consumer
            // names are stable across restarts, so draining the backlog at
            // id 0 first redelivers them.
            let backlog_opts = StreamReadOptions::default()
                .group(&group, &consumer)
                .count(READ_BATCH);
            let mut backlog_cursor = "0".to_string();

            'backlog: loop {
                let keys = [stream.as_str()];
                let ids = [backlog_cursor.as_str()];
                let reply: redis::RedisResult<StreamReadReply> = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = conn.xread_options(&keys, &ids, &backlog_opts) => r,
                };

                let reply = match reply {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(stream = %stream, group = %group, error = %e, "backlog read failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                        }
                        continue;
                    }
                };

                let mut drained = true;
                for key in reply.keys {
                    for entry in key.ids {
                        drained = false;
                        backlog_cursor = entry.id.clone();
                        if !deliver_entry(&mut conn, &tx, &stream, &group, entry).await {
                            debug!(group = %group, consumer = %consumer, "stream read loop stopped");
                            return;
                        }
                    }
                }
                if drained {
                    break 'backlog;
                }
            }

            let opts = StreamReadOptions::default()
                .group(&group, &consumer)
                .count(READ_BATCH)
                .block(READ_BLOCK_MS);

            'read: loop {
                let keys = [stream.as_str()];
                let reply: redis::RedisResult<StreamReadReply> = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = conn.xread_options(&keys, &[">"], &opts) => r,
                };

                let reply = match reply {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(stream = %stream, group = %group, error = %e, "stream read failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                        }
                        continue;
                    }
                };

                for key in reply.keys {
                    for entry in key.ids {
                        if !deliver_entry(&mut conn, &tx, &stream, &group, entry).await {
                            break 'read;
                        }
                    }
                }
            }
            debug!(group = %group, consumer = %consumer, "stream read loop stopped");
        });

        Ok(rx)
    }

    async fn acknowledge(&self, group: &str, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(&self.stream, group, &[entry_id])
            .await
            .context("failed to acknowledge entry")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Decode one stream entry and hand it to the consumer channel. Poison
/// entries are acknowledged immediately and dropped. Returns false once
/// the receiver is gone.
async fn deliver_entry(
    conn: &mut ConnectionManager,
    tx: &mpsc::Sender<QueueEntry>,
    stream: &str,
    group: &str,
    entry: StreamId,
) -> bool {
    let decoded = entry
        .map
        .get(EVENT_FIELD)
        .ok_or_else(|| anyhow::anyhow!("entry has no {EVENT_FIELD} field"))
        .and_then(|v| redis::from_redis_value::<String>(v).context("entry field is not a string"))
        .and_then(|raw| {
            serde_json::from_str::<Event>(&raw).context("entry payload is not a valid event")
        });

    match decoded {
        Ok(event) => tx
            .send(QueueEntry {
                id: entry.id.clone(),
                event,
            })
            .await
            .is_ok(),
        Err(e) => {
            // Poison entry: acknowledge immediately so it never blocks
            // group progress.
            error!(
                entry_id = %entry.id,
                group = %group,
                error = %e,
                "dropping undecodable stream entry"
            );
            let acked: redis::RedisResult<i64> = conn.xack(stream, group, &[&entry.id]).await;
            if let Err(e) = acked {
                warn!(entry_id = %entry.id, error = %e, "failed to ack poison entry");
            }
            true
        }
    }
}
