//! Delivery-outcome tracking.
//!
//! Every status transition of a `NotificationDelivery` is persisted through
//! `track`, which atomically upserts the record and keeps three indices
//! consistent: deliveries by event, deliveries by subscription, and a
//! recent-failures index ordered by completion time.

mod memory;
mod redis;

pub use memory::InMemoryDeliveryTracker;
pub use redis::RedisDeliveryTracker;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::NotificationDelivery;

/// Persistence seam for delivery records.
///
/// `track` is called on every status change and must apply the record
/// upsert and all index updates as a single atomic batch, so a crash
/// mid-update cannot leave the indices inconsistent with the record.
#[async_trait]
pub trait DeliveryTracker: Send + Sync {
    /// Upsert a delivery record and its index memberships. Idempotent:
    /// re-tracking the same ID and status leaves one record and one index
    /// entry.
    async fn track(&self, delivery: &NotificationDelivery) -> Result<()>;

    /// Fetch a delivery by ID. A missing ID yields `Error::NotFound`.
    async fn get(&self, id: &str) -> Result<NotificationDelivery>;

    /// All deliveries recorded for an event.
    async fn list_by_event(&self, event_id: &str) -> Result<Vec<NotificationDelivery>>;

    /// All deliveries recorded for a subscription.
    async fn list_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<NotificationDelivery>>;

    /// Failed deliveries, oldest failure first.
    async fn list_failed(&self) -> Result<Vec<NotificationDelivery>>;
}
