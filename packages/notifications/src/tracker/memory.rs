//! In-memory delivery tracker for tests and embedded use.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use super::DeliveryTracker;
use crate::error::Error;
use crate::model::{DeliveryStatus, NotificationDelivery};

#[derive(Default)]
struct State {
    records: HashMap<String, NotificationDelivery>,
    by_event: HashMap<String, HashSet<String>>,
    by_subscription: HashMap<String, HashSet<String>>,
    /// (completion millis, delivery ID) -> membership; ordered oldest first.
    failed: BTreeMap<(i64, String), ()>,
}

/// Tracker double holding everything under one lock, mirroring the atomic
/// batch semantics of the Redis implementation.
#[derive(Default)]
pub struct InMemoryDeliveryTracker {
    state: Mutex<State>,
}

impl InMemoryDeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held. Test helper.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DeliveryTracker for InMemoryDeliveryTracker {
    async fn track(&self, delivery: &NotificationDelivery) -> Result<()> {
        let mut state = self.lock();

        state
            .by_event
            .entry(delivery.event_id.clone())
            .or_default()
            .insert(delivery.id.clone());
        state
            .by_subscription
            .entry(delivery.subscription_id.clone())
            .or_default()
            .insert(delivery.id.clone());

        // One failed-index entry per delivery ID, keyed by completion time.
        state.failed.retain(|(_, id), _| id != &delivery.id);
        if delivery.status == DeliveryStatus::Failed {
            let score = delivery
                .completed_at
                .map(|t| t.timestamp_millis())
                .unwrap_or_default();
            state.failed.insert((score, delivery.id.clone()), ());
        }

        state.records.insert(delivery.id.clone(), delivery.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<NotificationDelivery> {
        self.lock()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!(Error::NotFound { id: id.to_string() }))
    }

    async fn list_by_event(&self, event_id: &str) -> Result<Vec<NotificationDelivery>> {
        let state = self.lock();
        Ok(state
            .by_event
            .get(event_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn list_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<NotificationDelivery>> {
        let state = self.lock();
        Ok(state
            .by_subscription
            .get(subscription_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn list_failed(&self) -> Result<Vec<NotificationDelivery>> {
        let state = self.lock();
        Ok(state
            .failed
            .keys()
            .filter_map(|(_, id)| state.records.get(id).cloned())
            .collect())
    }
}
