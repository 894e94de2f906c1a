//! Notification daemon.
//!
//! Wires the Redis-backed queue and tracker and the NATS-backed watcher
//! into an `EventProcessor`, then runs until SIGINT.

use std::sync::Arc;

use anyhow::{Context, Result};
use notifications::{
    CriteriaFilter, EventGenerator, EventProcessor, NatsBackendWatcher, RedisDeliveryTracker,
    RedisEventQueue, Settings, WebhookNotifier,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,notifications=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    dotenvy::dotenv().ok();
    let settings = Settings::from_env().context("invalid configuration")?;

    tracing::info!(
        redis = %settings.redis_url,
        nats = %settings.nats_url,
        subject = %settings.watch_subject,
        workers = settings.processor.workers,
        "starting notification daemon"
    );

    let queue = Arc::new(
        RedisEventQueue::connect(&settings.redis_url)
            .await
            .context("failed to set up event queue")?,
    );
    let tracker = Arc::new(
        RedisDeliveryTracker::connect(&settings.redis_url)
            .await
            .context("failed to set up delivery tracker")?,
    );
    let watcher = Arc::new(
        NatsBackendWatcher::connect(&settings.nats_url, settings.watch_subject.clone())
            .await
            .context("failed to set up backend watcher")?,
    );

    let generator = Arc::new(EventGenerator::with_config(
        watcher.clone(),
        watcher,
        settings.generator.clone(),
    ));
    let notifier = Arc::new(
        WebhookNotifier::new(settings.notifier.clone())
            .context("failed to build webhook notifier")?
            .with_tracker(tracker),
    );
    let filter = Arc::new(CriteriaFilter::new());

    let processor = EventProcessor::new(
        generator,
        queue,
        filter,
        notifier,
        settings.processor.clone(),
    );
    processor.start().await.context("failed to start pipeline")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    processor.stop().await;
    Ok(())
}
