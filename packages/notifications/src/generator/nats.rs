//! NATS-backed `BackendWatcher`.
//!
//! The inventory backend publishes `ChangeNotice` messages on a well-known
//! subject; each notice names the changed entity and carries its full
//! snapshot (absent for deletions). The watcher keeps the latest snapshot
//! per entity in a concurrent cache, so it also serves as the
//! `ResourceResolver` for the events it produced.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{BackendWatcher, ResourceRef, ResourceResolver, WatchEvent};
use crate::model::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// One change message as published by the backend translation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotice {
    pub change_type: ChangeType,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub type_id: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Snapshot of the entity after the change; absent for deletions.
    #[serde(default)]
    pub object: Option<serde_json::Value>,
}

impl ChangeNotice {
    fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            entity_kind: self.entity_kind,
            entity_id: self.entity_id.clone(),
            pool_id: self.pool_id.clone(),
            type_id: self.type_id.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Watches a NATS subject for backend change notices.
pub struct NatsBackendWatcher {
    client: async_nats::Client,
    subject: String,
    snapshots: Arc<DashMap<String, serde_json::Value>>,
}

impl NatsBackendWatcher {
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
            snapshots: Arc::new(DashMap::new()),
        }
    }

    /// Connect to NATS and build a watcher.
    pub async fn connect(url: &str, subject: impl Into<String>) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .context("failed to connect to nats")?;
        Ok(Self::new(client, subject))
    }

    fn snapshot_key(kind: EntityKind, id: &str) -> String {
        format!("{kind:?}/{id}")
    }
}

#[async_trait]
impl BackendWatcher for NatsBackendWatcher {
    async fn watch(&self) -> Result<BoxStream<'static, WatchEvent>> {
        let subscriber = self
            .client
            .subscribe(self.subject.clone())
            .await
            .with_context(|| format!("failed to subscribe to {}", self.subject))?;
        info!(subject = %self.subject, "watching backend change subject");

        let snapshots = self.snapshots.clone();
        let stream = subscriber
            .map(move |message| {
                let notice = match serde_json::from_slice::<ChangeNotice>(&message.payload) {
                    Ok(notice) => notice,
                    Err(e) => return WatchEvent::Error(format!("undecodable change notice: {e}")),
                };

                let key = Self::snapshot_key(notice.entity_kind, &notice.entity_id);
                match notice.change_type {
                    ChangeType::Added | ChangeType::Modified => {
                        if let Some(object) = &notice.object {
                            snapshots.insert(key, object.clone());
                        }
                    }
                    ChangeType::Deleted => {
                        snapshots.remove(&key);
                    }
                }

                let resource = notice.resource_ref();
                match notice.change_type {
                    ChangeType::Added => WatchEvent::Added(resource),
                    ChangeType::Modified => WatchEvent::Modified(resource),
                    ChangeType::Deleted => WatchEvent::Deleted(resource),
                }
            })
            .boxed();

        Ok(stream)
    }
}

#[async_trait]
impl ResourceResolver for NatsBackendWatcher {
    async fn resolve(&self, resource: &ResourceRef) -> Result<Option<serde_json::Value>> {
        let key = Self::snapshot_key(resource.entity_kind, &resource.entity_id);
        Ok(self.snapshots.get(&key).map(|v| v.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_notice_round_trip() {
        let raw = serde_json::json!({
            "change_type": "modified",
            "entity_kind": "resource",
            "entity_id": "n1",
            "pool_id": "p1",
            "labels": {"site": "edge-1"},
            "object": {"resourceId": "n1", "status": "ready"},
        });
        let notice: ChangeNotice = serde_json::from_value(raw).unwrap();
        assert_eq!(notice.change_type, ChangeType::Modified);
        assert_eq!(notice.entity_kind, EntityKind::Resource);
        assert_eq!(notice.pool_id.as_deref(), Some("p1"));
        assert!(notice.object.is_some());
    }

    #[test]
    fn test_deletion_notice_has_no_object() {
        let raw = serde_json::json!({
            "change_type": "deleted",
            "entity_kind": "resource_pool",
            "entity_id": "p9",
        });
        let notice: ChangeNotice = serde_json::from_value(raw).unwrap();
        assert_eq!(notice.change_type, ChangeType::Deleted);
        assert!(notice.object.is_none());
        assert!(notice.labels.is_empty());
    }
}
