//! Pipeline orchestration.
//!
//! `EventProcessor` wires the stages together and owns their lifecycles:
//!
//! ```text
//! EventGenerator ──channel──► publisher task ──► EventQueue
//!                                                   │ consumer group
//!                                 worker 0..N ◄─────┘
//!                                   │  SubscriptionFilter
//!                                   ▼
//!                             WebhookNotifier ──► DeliveryTracker
//! ```
//!
//! Workers share one consumer group, so the stream is partitioned between
//! them and every event is processed once per group. An entry is
//! acknowledged only after delivery has been attempted for every matching
//! subscription; individual delivery failures never block the ack.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::filter::SubscriptionFilter;
use crate::generator::EventGenerator;
use crate::notifier::WebhookNotifier;
use crate::queue::{EventQueue, QueueEntry};

pub struct EventProcessor {
    generator: Arc<EventGenerator>,
    queue: Arc<dyn EventQueue>,
    filter: Arc<dyn SubscriptionFilter>,
    notifier: Arc<WebhookNotifier>,
    config: ProcessorConfig,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl EventProcessor {
    /// Panics if the worker count is zero or the consumer group name is
    /// empty; both are wiring bugs, not runtime conditions.
    pub fn new(
        generator: Arc<EventGenerator>,
        queue: Arc<dyn EventQueue>,
        filter: Arc<dyn SubscriptionFilter>,
        notifier: Arc<WebhookNotifier>,
        config: ProcessorConfig,
    ) -> Self {
        assert!(config.workers >= 1, "processor needs at least one worker");
        assert!(
            !config.consumer_group.is_empty(),
            "processor needs a consumer group name"
        );
        Self {
            generator,
            queue,
            filter,
            notifier,
            config,
            cancel: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Start the generator, the publisher task, and the worker pool.
    pub async fn start(&self) -> Result<()> {
        {
            let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            if !tasks.is_empty() {
                bail!("event processor already started");
            }
        }

        let mut events = self
            .generator
            .start()
            .context("failed to start event generator")?;

        let mut tasks = Vec::with_capacity(self.config.workers + 1);

        // Publisher: drain the generator channel into the durable queue.
        // A publish failure loses that one event; the pipeline keeps going.
        let queue = self.queue.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = queue.publish(&event).await {
                    error!(event_id = %event.id, error = %e, "failed to enqueue event");
                }
            }
            debug!("event publisher stopped");
        }));

        for i in 0..self.config.workers {
            let consumer = format!("worker-{i}");
            let entries = self
                .queue
                .subscribe(&self.config.consumer_group, &consumer)
                .await
                .with_context(|| format!("failed to subscribe {consumer}"))?;
            tasks.push(self.spawn_worker(consumer, entries));
        }

        info!(
            workers = self.config.workers,
            group = %self.config.consumer_group,
            "event processor started"
        );

        let mut slot = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        *slot = tasks;
        Ok(())
    }

    fn spawn_worker(
        &self,
        consumer: String,
        mut entries: tokio::sync::mpsc::Receiver<QueueEntry>,
    ) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let filter = self.filter.clone();
        let notifier = self.notifier.clone();
        let group = self.config.consumer_group.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let entry = tokio::select! {
                    _ = cancel.cancelled() => break,
                    entry = entries.recv() => match entry {
                        Some(entry) => entry,
                        None => break,
                    },
                };
                process_entry(&*queue, &*filter, &notifier, &group, &consumer, entry, &cancel)
                    .await;
            }
            debug!(consumer = %consumer, "worker stopped");
        })
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn stop(&self) {
        self.generator.stop().await;
        self.cancel.cancel();
        if let Err(e) = self.queue.close().await {
            warn!(error = %e, "failed to close event queue");
        }

        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for task in tasks {
            let _ = task.await;
        }
        info!("event processor stopped");
    }
}

/// Handle one queue entry end to end.
///
/// The entry is acknowledged once delivery has been attempted for every
/// matching subscription, whatever the outcomes. A filter failure leaves
/// the entry unacknowledged so the group redelivers it.
async fn process_entry(
    queue: &dyn EventQueue,
    filter: &dyn SubscriptionFilter,
    notifier: &WebhookNotifier,
    group: &str,
    consumer: &str,
    entry: QueueEntry,
    cancel: &CancellationToken,
) {
    let subscriptions = match filter.match_subscriptions(&entry.event).await {
        Ok(subscriptions) => subscriptions,
        Err(e) => {
            error!(
                event_id = %entry.event.id,
                consumer = %consumer,
                error = %e,
                "subscription matching failed, leaving entry for redelivery"
            );
            return;
        }
    };

    debug!(
        event_id = %entry.event.id,
        consumer = %consumer,
        matches = subscriptions.len(),
        "processing event"
    );

    for subscription in &subscriptions {
        if let Err(e) = notifier
            .notify_with_retry(&entry.event, subscription, cancel)
            .await
        {
            // Already tracked and logged by the notifier; the remaining
            // subscriptions still get their deliveries.
            debug!(
                event_id = %entry.event.id,
                subscription_id = %subscription.id,
                error = %e,
                "delivery gave up"
            );
        }
    }

    if let Err(e) = queue.acknowledge(group, &entry.id).await {
        warn!(
            event_id = %entry.event.id,
            entry_id = %entry.id,
            error = %e,
            "failed to acknowledge entry"
        );
    }
}
