//! Change-event generation from a watched backend.
//!
//! `EventGenerator` turns a backend watch stream into `Event` values on a
//! bounded channel. It owns two collaborator seams: `BackendWatcher` (the
//! change stream) and `ResourceResolver` (the translation layer that maps
//! a backend object reference to the gateway's resource representation).
//!
//! Liveness over completeness: when the channel is full the newest event is
//! dropped with a warning. The watch loop reconnects transparently after a
//! fixed backoff and shuts down cleanly on `stop()`, closing the channel
//! exactly once.

mod nats;

pub use nats::{ChangeNotice, ChangeType, NatsBackendWatcher};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GeneratorConfig;
use crate::model::{EntityKind, Event, EventType};

/// Reference to a backend object observed on the watch stream.
#[derive(Debug, Clone)]
pub struct ResourceRef {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub pool_id: Option<String>,
    pub type_id: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ResourceRef {
    pub fn new(entity_kind: EntityKind, entity_id: impl Into<String>) -> Self {
        Self {
            entity_kind,
            entity_id: entity_id.into(),
            pool_id: None,
            type_id: None,
            labels: HashMap::new(),
        }
    }
}

/// One signal observed on the backend watch stream.
///
/// Bookmarks and stream-level errors are swallowed by the generator; only
/// Added/Modified/Deleted produce events.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(ResourceRef),
    Modified(ResourceRef),
    Deleted(ResourceRef),
    Bookmark,
    Error(String),
}

/// The backend's change stream. A stream that ends or an open that fails
/// triggers reconnect-with-backoff in the generator.
#[async_trait]
pub trait BackendWatcher: Send + Sync {
    async fn watch(&self) -> Result<BoxStream<'static, WatchEvent>>;
}

/// The translation layer: current representation of a backend object, or
/// `None` if it no longer exists.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(&self, resource: &ResourceRef) -> Result<Option<serde_json::Value>>;
}

/// Watches the backend and emits change events on a bounded channel.
pub struct EventGenerator {
    watcher: Arc<dyn BackendWatcher>,
    resolver: Arc<dyn ResourceResolver>,
    config: GeneratorConfig,
    cancel: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl EventGenerator {
    pub fn new(watcher: Arc<dyn BackendWatcher>, resolver: Arc<dyn ResourceResolver>) -> Self {
        Self::with_config(watcher, resolver, GeneratorConfig::default())
    }

    pub fn with_config(
        watcher: Arc<dyn BackendWatcher>,
        resolver: Arc<dyn ResourceResolver>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            watcher,
            resolver,
            config,
            cancel: CancellationToken::new(),
            handle: std::sync::Mutex::new(None),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Launch the watch loop and return the event channel. The channel is
    /// closed exactly once, when the loop stops.
    pub fn start(&self) -> Result<mpsc::Receiver<Event>> {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            bail!("event generator already started");
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let watcher = self.watcher.clone();
        let resolver = self.resolver.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        let dropped = self.dropped.clone();

        *handle = Some(tokio::spawn(async move {
            run_watch_loop(watcher, resolver, config, cancel, tx, dropped).await;
        }));
        Ok(rx)
    }

    /// Signal shutdown and wait for the watch loop to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Events dropped because the channel was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run_watch_loop(
    watcher: Arc<dyn BackendWatcher>,
    resolver: Arc<dyn ResourceResolver>,
    config: GeneratorConfig,
    cancel: CancellationToken,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
) {
    'outer: loop {
        if cancel.is_cancelled() {
            break;
        }

        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            s = watcher.watch() => s,
        };

        match stream {
            Ok(mut stream) => {
                info!("backend watch established");
                loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => break 'outer,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(watch_event) => {
                            handle_watch_event(&resolver, watch_event, &tx, &dropped).await;
                        }
                        None => {
                            warn!("backend watch stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to open backend watch, retrying");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_backoff) => {}
        }
    }

    info!("event generator stopped");
    // tx drops here, closing the channel exactly once.
}

async fn handle_watch_event(
    resolver: &Arc<dyn ResourceResolver>,
    watch_event: WatchEvent,
    tx: &mpsc::Sender<Event>,
    dropped: &AtomicU64,
) {
    let (event_type, resource) = match watch_event {
        WatchEvent::Added(r) => (EventType::Created, r),
        WatchEvent::Modified(r) => (EventType::Updated, r),
        WatchEvent::Deleted(r) => (EventType::Deleted, r),
        WatchEvent::Bookmark => return,
        WatchEvent::Error(msg) => {
            debug!(error = %msg, "backend watch signal swallowed");
            return;
        }
    };

    let payload = match resolver.resolve(&resource).await {
        Ok(Some(payload)) => payload,
        Ok(None) | Err(_) if event_type == EventType::Deleted => tombstone(&resource),
        Ok(None) => {
            warn!(
                entity_id = %resource.entity_id,
                "resource disappeared before it could be snapshotted, skipping event"
            );
            return;
        }
        Err(e) => {
            warn!(
                entity_id = %resource.entity_id,
                error = %e,
                "failed to resolve resource, skipping event"
            );
            return;
        }
    };

    let mut event = Event::new(event_type, resource.entity_kind, resource.entity_id, payload);
    event.pool_id = resource.pool_id;
    event.type_id = resource.type_id;
    event.labels = resource.labels;

    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = %event.id,
                entity_id = %event.entity_id,
                "event channel full, dropping event"
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Minimal payload for a deletion whose object is already gone.
fn tombstone(resource: &ResourceRef) -> serde_json::Value {
    serde_json::json!({
        "resourceId": resource.entity_id,
        "deleted": true,
    })
}
