//! Durable, replayable, consumer-group event queue.
//!
//! One logical append-only stream carries every event in generation order.
//! Consumers subscribe under a named group; consumers sharing a group split
//! the stream between them (competing consumers), and entries stay on the
//! group's pending list until explicitly acknowledged, giving at-least-once
//! redelivery across crashes.

mod memory;
mod redis;

pub use memory::InMemoryEventQueue;
pub use redis::RedisEventQueue;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::Event;

/// One queue entry handed to a consumer. The `id` is the delivery handle
/// passed back to `acknowledge`.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub event: Event,
}

/// The queue seam between the processor and the durable log.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Serialize and append an event. Serialization or append failures are
    /// returned synchronously; the event is never silently dropped.
    async fn publish(&self, event: &Event) -> Result<()>;

    /// Join `group` (created lazily at the start of the log; an existing
    /// group is not an error) as `consumer` and receive entries on the
    /// returned channel. Entries delivered but never acknowledged are
    /// redelivered ahead of new ones, so a crash between delivery and
    /// acknowledgment loses nothing. Decodable entries are NOT
    /// auto-acknowledged; undecodable entries are acknowledged immediately
    /// and dropped so a poison message never stalls the group.
    async fn subscribe(&self, group: &str, consumer: &str) -> Result<mpsc::Receiver<QueueEntry>>;

    /// Remove an entry from the group's pending list. Call only after the
    /// entry has been fully processed.
    async fn acknowledge(&self, group: &str, entry_id: &str) -> Result<()>;

    /// Stop all background read loops.
    async fn close(&self) -> Result<()>;
}
