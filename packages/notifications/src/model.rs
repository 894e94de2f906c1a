//! Data model for the notification pipeline.
//!
//! `Event` is the immutable fact that flows through the queue;
//! `NotificationDelivery` is the mutable record of one delivery sequence
//! for one (event, subscription) pair; `Subscription` is read-only input
//! owned by the subscription store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

/// Which kind of inventory entity changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Resource,
    ResourcePool,
    ResourceType,
    DeploymentManager,
}

/// Delivery status state machine:
/// `Pending -> Delivering -> {Delivered | Retrying -> Delivering | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Delivering,
    Delivered,
    Retrying,
    Failed,
}

impl DeliveryStatus {
    /// Terminal states carry a completion timestamp and are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

// ============================================================================
// Event
// ============================================================================

/// An immutable record that an inventory entity changed.
///
/// Created by the generator, serialized verbatim through the queue, and
/// read-only for every downstream stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique, generator-assigned identifier.
    pub id: String,
    pub event_type: EventType,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,
    /// Snapshot of the changed entity, or a minimal tombstone for deletions.
    pub payload: serde_json::Value,
    /// UTC, set at generation time.
    pub timestamp: DateTime<Utc>,
    /// Used by the subscription filter for label matching.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            entity_kind,
            entity_id: entity_id.into(),
            pool_id: None,
            type_id: None,
            payload,
            timestamp: Utc::now(),
            labels: HashMap::new(),
            extensions: serde_json::Map::new(),
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Matching criteria for a subscription.
///
/// AND semantics across fields, OR semantics within a multi-valued field.
/// An empty field matches any event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionCriteria {
    #[serde(default)]
    pub pool_ids: Vec<String>,
    #[serde(default)]
    pub type_ids: Vec<String>,
    #[serde(default)]
    pub resource_ids: Vec<String>,
    /// Every entry must be present as `key=value` in the event's labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl SubscriptionCriteria {
    /// Returns true if the event satisfies every criteria field.
    pub fn matches(&self, event: &Event) -> bool {
        let pool_ok = self.pool_ids.is_empty()
            || event
                .pool_id
                .as_ref()
                .is_some_and(|p| self.pool_ids.contains(p));
        let type_ok = self.type_ids.is_empty()
            || event
                .type_id
                .as_ref()
                .is_some_and(|t| self.type_ids.contains(t));
        let resource_ok =
            self.resource_ids.is_empty() || self.resource_ids.contains(&event.entity_id);
        let labels_ok = self
            .labels
            .iter()
            .all(|(k, v)| event.labels.get(k) == Some(v));

        pool_ok && type_ok && resource_ok && labels_ok
    }
}

/// A consumer's registration for webhook notifications.
///
/// Owned by the subscription store; the pipeline only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub callback_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_subscription_id: Option<String>,
    #[serde(default)]
    pub criteria: SubscriptionCriteria,
}

// ============================================================================
// NotificationDelivery
// ============================================================================

/// The record of one delivery sequence for one (event, subscription) pair.
///
/// Created when the sequence starts, mutated in place across retries, and
/// persisted after every status change. Invariants:
/// `attempts <= max_attempts`; `completed_at` is set iff the status is
/// terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationDelivery {
    pub id: String,
    pub event_id: String,
    pub subscription_id: String,
    pub callback_url: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_millis: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NotificationDelivery {
    pub fn new(
        event_id: impl Into<String>,
        subscription_id: impl Into<String>,
        callback_url: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_id: event_id.into(),
            subscription_id: subscription_id.into(),
            callback_url: callback_url.into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts,
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
            http_status_code: None,
            response_time_millis: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move to a terminal state and stamp the completion time.
    pub fn complete(&mut self, status: DeliveryStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

// ============================================================================
// Webhook payload
// ============================================================================

/// JSON body POSTed to a subscription's callback URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub subscription_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_subscription_id: Option<String>,
    pub event_type: EventType,
    pub resource: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl NotificationPayload {
    pub fn build(event: &Event, subscription: &Subscription) -> Self {
        Self {
            subscription_id: subscription.id.clone(),
            consumer_subscription_id: subscription.consumer_subscription_id.clone(),
            event_type: event.event_type,
            resource: event.payload.clone(),
            timestamp: event.timestamp,
            extensions: event.extensions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with_pool(pool: &str) -> Event {
        let mut event = Event::new(
            EventType::Created,
            EntityKind::Resource,
            "n1",
            serde_json::json!({"resourceId": "n1"}),
        );
        event.pool_id = Some(pool.to_string());
        event
    }

    #[test]
    fn test_event_serde_round_trip() {
        let mut event = event_with_pool("p1");
        event.labels.insert("site".to_string(), "edge-1".to_string());
        event
            .extensions
            .insert("vendor".to_string(), serde_json::json!("acme"));

        let raw = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&raw).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_criteria_empty_matches_any() {
        let criteria = SubscriptionCriteria::default();
        assert!(criteria.matches(&event_with_pool("p1")));
    }

    #[test]
    fn test_criteria_pool_match() {
        let criteria = SubscriptionCriteria {
            pool_ids: vec!["p1".to_string()],
            ..Default::default()
        };
        assert!(criteria.matches(&event_with_pool("p1")));
        assert!(!criteria.matches(&event_with_pool("p2")));
    }

    #[test]
    fn test_criteria_pool_or_semantics() {
        let criteria = SubscriptionCriteria {
            pool_ids: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        assert!(criteria.matches(&event_with_pool("a")));
        assert!(criteria.matches(&event_with_pool("b")));
        assert!(!criteria.matches(&event_with_pool("c")));
    }

    #[test]
    fn test_criteria_and_across_fields() {
        let mut criteria = SubscriptionCriteria {
            pool_ids: vec!["p1".to_string()],
            ..Default::default()
        };
        criteria
            .labels
            .insert("site".to_string(), "edge-1".to_string());

        let mut event = event_with_pool("p1");
        assert!(!criteria.matches(&event)); // label missing

        event.labels.insert("site".to_string(), "edge-1".to_string());
        assert!(criteria.matches(&event));
    }

    #[test]
    fn test_criteria_missing_pool_id_fails_pool_criteria() {
        let criteria = SubscriptionCriteria {
            pool_ids: vec!["p1".to_string()],
            ..Default::default()
        };
        let event = Event::new(
            EventType::Updated,
            EntityKind::Resource,
            "n1",
            serde_json::json!({}),
        );
        assert!(!criteria.matches(&event));
    }

    #[test]
    fn test_delivery_complete_sets_timestamp() {
        let mut delivery = NotificationDelivery::new("e1", "s1", "http://cb", 3);
        assert!(delivery.completed_at.is_none());

        delivery.complete(DeliveryStatus::Failed);
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert!(delivery.completed_at.is_some());
    }

    #[test]
    fn test_payload_shape_is_camel_case() {
        let event = event_with_pool("p1");
        let subscription = Subscription {
            id: "s1".to_string(),
            callback_url: "http://cb".to_string(),
            consumer_subscription_id: Some("ext-1".to_string()),
            criteria: SubscriptionCriteria::default(),
        };

        let payload = NotificationPayload::build(&event, &subscription);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["subscriptionId"], "s1");
        assert_eq!(value["consumerSubscriptionId"], "ext-1");
        assert_eq!(value["eventType"], "created");
        assert_eq!(value["resource"]["resourceId"], "n1");
    }
}
