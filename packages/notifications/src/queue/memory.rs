//! In-memory event queue for tests and embedded single-process use.
//!
//! Mirrors the semantics of the Redis stream implementation: a shared
//! append-only log, per-group cursors, explicit acknowledgment with a
//! pending list, and redelivery of pending entries to newly joined
//! consumers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::{EventQueue, QueueEntry};
use crate::model::Event;

/// Bounded poll interval for consumers waiting on an empty log.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

struct LogEntry {
    id: String,
    raw: String,
}

#[derive(Default)]
struct GroupState {
    /// Next log index this group has not yet claimed.
    cursor: usize,
    /// Delivered-but-unacknowledged entries: entry ID -> log index.
    pending: HashMap<String, usize>,
}

#[derive(Default)]
struct SharedState {
    log: Vec<LogEntry>,
    groups: HashMap<String, GroupState>,
}

struct Inner {
    state: Mutex<SharedState>,
    cancel: CancellationToken,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the next entry for a consumer: redeliveries first, then the
    /// group cursor. Returns `(entry_id, raw_payload)`.
    fn claim_next(&self, group: &str, redeliver: &mut VecDeque<String>) -> Option<(String, String)> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let group_state = state.groups.get_mut(group)?;

        while let Some(id) = redeliver.pop_front() {
            // Entries acknowledged since the snapshot are skipped.
            if let Some(&idx) = group_state.pending.get(&id) {
                let entry = &state.log[idx];
                return Some((entry.id.clone(), entry.raw.clone()));
            }
        }

        if group_state.cursor < state.log.len() {
            let idx = group_state.cursor;
            group_state.cursor += 1;
            let entry = &state.log[idx];
            group_state.pending.insert(entry.id.clone(), idx);
            return Some((entry.id.clone(), entry.raw.clone()));
        }

        None
    }

    fn ack(&self, group: &str, entry_id: &str) {
        if let Some(group_state) = self.lock().groups.get_mut(group) {
            group_state.pending.remove(entry_id);
        }
    }
}

/// Single-process queue with the durable-log contract.
pub struct InMemoryEventQueue {
    inner: Arc<Inner>,
}

impl Default for InMemoryEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SharedState::default()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Append a raw (possibly malformed) payload. Test hook for the
    /// poison-message path.
    pub fn publish_raw(&self, raw: impl Into<String>) -> String {
        let mut state = self.inner.lock();
        let id = format!("{}-0", state.log.len() + 1);
        state.log.push(LogEntry {
            id: id.clone(),
            raw: raw.into(),
        });
        id
    }

    /// Entries delivered to `group` but not yet acknowledged.
    pub fn pending_count(&self, group: &str) -> usize {
        self.inner
            .lock()
            .groups
            .get(group)
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Total entries in the log.
    pub fn len(&self) -> usize {
        self.inner.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventQueue for InMemoryEventQueue {
    async fn publish(&self, event: &Event) -> Result<()> {
        let raw = serde_json::to_string(event).context("failed to serialize event")?;
        self.publish_raw(raw);
        Ok(())
    }

    async fn subscribe(&self, group: &str, consumer: &str) -> Result<mpsc::Receiver<QueueEntry>> {
        let inner = self.inner.clone();
        let group = group.to_string();
        let consumer = consumer.to_string();

        // Lazily create the group at the start of the log, and snapshot its
        // pending entries for redelivery to this consumer.
        let mut redeliver: VecDeque<String> = {
            let mut state = inner.lock();
            let group_state = state.groups.entry(group.clone()).or_default();
            let mut pending: Vec<(usize, String)> = group_state
                .pending
                .iter()
                .map(|(id, &idx)| (idx, id.clone()))
                .collect();
            pending.sort_unstable();
            pending.into_iter().map(|(_, id)| id).collect()
        };

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                if inner.cancel.is_cancelled() {
                    break;
                }
                match inner.claim_next(&group, &mut redeliver) {
                    Some((id, raw)) => match serde_json::from_str::<Event>(&raw) {
                        Ok(event) => {
                            if tx.send(QueueEntry { id, event }).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // Poison entry: acknowledge so the group moves on.
                            error!(
                                entry_id = %id,
                                group = %group,
                                consumer = %consumer,
                                error = %e,
                                "dropping undecodable queue entry"
                            );
                            inner.ack(&group, &id);
                        }
                    },
                    None => {
                        tokio::select! {
                            _ = inner.cancel.cancelled() => break,
                            _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn acknowledge(&self, group: &str, entry_id: &str) -> Result<()> {
        self.inner.ack(group, entry_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.cancel.cancel();
        Ok(())
    }
}
