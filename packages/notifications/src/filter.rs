//! Subscription matching.
//!
//! The processor only sees the `SubscriptionFilter` seam; the gateway's
//! subscription store plugs in behind it. `CriteriaFilter` is the built-in
//! implementation over an in-memory registry.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{Event, Subscription};

/// Returns every subscription whose criteria the event satisfies.
#[async_trait]
pub trait SubscriptionFilter: Send + Sync {
    async fn match_subscriptions(&self, event: &Event) -> Result<Vec<Subscription>>;
}

/// Filter over an in-memory subscription registry.
///
/// Matching is AND across criteria fields and OR within a multi-valued
/// field; an absent field matches any event (see
/// `SubscriptionCriteria::matches`).
#[derive(Default)]
pub struct CriteriaFilter {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl CriteriaFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a subscription.
    pub fn upsert(&self, subscription: Subscription) {
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subscription.id.clone(), subscription);
    }

    /// Remove a subscription. Returns true if it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SubscriptionFilter for CriteriaFilter {
    async fn match_subscriptions(&self, event: &Event) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<Subscription> = subscriptions
            .values()
            .filter(|s| s.criteria.matches(event))
            .cloned()
            .collect();
        // Deterministic delivery order.
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, EventType, SubscriptionCriteria};

    fn subscription(id: &str, criteria: SubscriptionCriteria) -> Subscription {
        Subscription {
            id: id.to_string(),
            callback_url: format!("http://callbacks/{id}"),
            consumer_subscription_id: None,
            criteria,
        }
    }

    fn event_in_pool(pool: &str) -> Event {
        let mut event = Event::new(
            EventType::Created,
            EntityKind::Resource,
            "n1",
            serde_json::json!({"resourceId": "n1"}),
        );
        event.pool_id = Some(pool.to_string());
        event
    }

    #[tokio::test]
    async fn test_pool_criteria_match_and_miss() {
        let filter = CriteriaFilter::new();
        filter.upsert(subscription(
            "s1",
            SubscriptionCriteria {
                pool_ids: vec!["p1".to_string()],
                ..Default::default()
            },
        ));

        let matched = filter
            .match_subscriptions(&event_in_pool("p1"))
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "s1");

        let matched = filter
            .match_subscriptions(&event_in_pool("p2"))
            .await
            .unwrap();
        assert!(matched.is_empty());
    }

    #[tokio::test]
    async fn test_catch_all_subscription_matches_everything() {
        let filter = CriteriaFilter::new();
        filter.upsert(subscription("all", SubscriptionCriteria::default()));

        let matched = filter
            .match_subscriptions(&event_in_pool("anything"))
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn test_matches_are_sorted_by_id() {
        let filter = CriteriaFilter::new();
        filter.upsert(subscription("b", SubscriptionCriteria::default()));
        filter.upsert(subscription("a", SubscriptionCriteria::default()));

        let matched = filter
            .match_subscriptions(&event_in_pool("p1"))
            .await
            .unwrap();
        let ids: Vec<_> = matched.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_remove() {
        let filter = CriteriaFilter::new();
        filter.upsert(subscription("s1", SubscriptionCriteria::default()));
        assert!(filter.remove("s1"));
        assert!(!filter.remove("s1"));
        assert!(filter.is_empty());
    }
}
