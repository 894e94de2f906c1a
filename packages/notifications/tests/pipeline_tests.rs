//! End-to-end pipeline tests against an in-process webhook receiver.
//!
//! Everything here runs without external services: the queue and tracker
//! are the in-memory implementations and the callback endpoint is an axum
//! server bound to an ephemeral port.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use notifications::{
    BackendWatcher, BreakerConfig, CircuitState, CriteriaFilter, DeliveryStatus, DeliveryTracker,
    EntityKind, Error, Event, EventGenerator, EventProcessor, EventType, GeneratorConfig,
    InMemoryDeliveryTracker, InMemoryEventQueue, NotifierConfig, ProcessorConfig, ResourceRef,
    ResourceResolver, Subscription, SubscriptionCriteria, TransportConfig, WatchEvent,
    WebhookNotifier,
};

/// Webhook receiver that replays a script of status codes, then returns the
/// last one forever. Counts every request it sees.
#[derive(Clone)]
struct Receiver {
    script: Arc<Mutex<VecDeque<StatusCode>>>,
    fallback: StatusCode,
    hits: Arc<AtomicUsize>,
}

impl Receiver {
    async fn spawn(script: Vec<StatusCode>, fallback: StatusCode) -> (String, Self) {
        let receiver = Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback,
            hits: Arc::new(AtomicUsize::new(0)),
        };

        async fn handle(State(receiver): State<Receiver>) -> StatusCode {
            receiver.hits.fetch_add(1, Ordering::SeqCst);
            receiver
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(receiver.fallback)
        }

        let app = Router::new()
            .route("/callback", post(handle))
            .with_state(receiver.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/callback"), receiver)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn fast_notifier_config() -> NotifierConfig {
    NotifierConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        transport: TransportConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        },
        breaker: BreakerConfig {
            failure_threshold: 3,
            cool_down: Duration::from_secs(30),
            half_open_max_calls: 3,
        },
    }
}

fn subscription(id: &str, url: &str) -> Subscription {
    Subscription {
        id: id.to_string(),
        callback_url: url.to_string(),
        consumer_subscription_id: Some(format!("consumer-{id}")),
        criteria: SubscriptionCriteria::default(),
    }
}

fn event(id: &str) -> Event {
    let mut e = Event::new(
        EventType::Created,
        EntityKind::Resource,
        "n1",
        serde_json::json!({"resourceId": "n1", "status": "ready"}),
    );
    e.id = id.to_string();
    e
}

#[tokio::test]
async fn test_single_attempt_notify_success() {
    let (url, receiver) = Receiver::spawn(vec![], StatusCode::NO_CONTENT).await;
    let notifier = WebhookNotifier::new(fast_notifier_config()).unwrap();

    notifier
        .notify(&event("e1"), &subscription("s1", &url))
        .await
        .unwrap();
    assert_eq!(receiver.hits(), 1);
}

#[tokio::test]
async fn test_single_attempt_notify_surfaces_non_2xx() {
    let (url, receiver) = Receiver::spawn(vec![], StatusCode::SERVICE_UNAVAILABLE).await;
    let notifier = WebhookNotifier::new(fast_notifier_config()).unwrap();

    let err = notifier
        .notify(&event("e1"), &subscription("s1", &url))
        .await
        .unwrap_err();
    // One attempt, no retry, status carried in the error.
    assert_eq!(receiver.hits(), 1);
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn test_delivery_succeeds_first_attempt() {
    let (url, receiver) = Receiver::spawn(vec![], StatusCode::NO_CONTENT).await;
    let notifier = WebhookNotifier::new(fast_notifier_config()).unwrap();

    let delivery = notifier
        .notify_with_retry(&event("e1"), &subscription("s1", &url), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.http_status_code, Some(204));
    assert!(delivery.completed_at.is_some());
    assert_eq!(receiver.hits(), 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried_to_success() {
    let (url, receiver) = Receiver::spawn(
        vec![StatusCode::INTERNAL_SERVER_ERROR],
        StatusCode::NO_CONTENT,
    )
    .await;
    let notifier = WebhookNotifier::new(fast_notifier_config()).unwrap();

    let delivery = notifier
        .notify_with_retry(&event("e1"), &subscription("s1", &url), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempts, 2);
    assert_eq!(receiver.hits(), 2);
}

#[tokio::test]
async fn test_attempt_budget_is_exact() {
    // The endpoint would recover on the fourth request, but the budget is
    // three attempts.
    let (url, receiver) = Receiver::spawn(
        vec![
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::INTERNAL_SERVER_ERROR,
        ],
        StatusCode::NO_CONTENT,
    )
    .await;
    let tracker = Arc::new(InMemoryDeliveryTracker::new());
    let notifier = WebhookNotifier::new(fast_notifier_config())
        .unwrap()
        .with_tracker(tracker.clone());

    let err = notifier
        .notify_with_retry(&event("e1"), &subscription("s1", &url), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(receiver.hits(), 3);
    match err.downcast_ref::<Error>() {
        Some(Error::DeliveryFailed { attempts, .. }) => assert_eq!(*attempts, 3),
        other => panic!("unexpected error: {other:?}"),
    }

    // The tracker holds the terminal record.
    let failed = tracker.list_failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, DeliveryStatus::Failed);
    assert_eq!(failed[0].attempts, 3);
    assert_eq!(failed[0].event_id, "e1");
    assert!(failed[0].last_error.is_some());
}

#[tokio::test]
async fn test_tracking_is_idempotent_per_delivery() {
    let (url, _receiver) =
        Receiver::spawn(vec![], StatusCode::INTERNAL_SERVER_ERROR).await;
    let tracker = Arc::new(InMemoryDeliveryTracker::new());
    let notifier = WebhookNotifier::new(fast_notifier_config())
        .unwrap()
        .with_tracker(tracker.clone());

    let _ = notifier
        .notify_with_retry(&event("e1"), &subscription("s1", &url), &CancellationToken::new())
        .await;

    // Every status transition tracked the same record ID, so exactly one
    // record exists for the (event, subscription) pair.
    let by_event = tracker.list_by_event("e1").await.unwrap();
    assert_eq!(by_event.len(), 1);
    let by_subscription = tracker.list_by_subscription("s1").await.unwrap();
    assert_eq!(by_subscription.len(), 1);
    assert_eq!(by_event[0].id, by_subscription[0].id);
}

#[tokio::test]
async fn test_circuit_opens_and_fails_fast() {
    let (url, receiver) =
        Receiver::spawn(vec![], StatusCode::INTERNAL_SERVER_ERROR).await;
    let mut config = fast_notifier_config();
    config.max_attempts = 1;
    let notifier = WebhookNotifier::new(config).unwrap();
    let subscription = subscription("s1", &url);
    let cancel = CancellationToken::new();

    // Three failures trip the breaker.
    for i in 0..3 {
        let err = notifier
            .notify_with_retry(&event(&format!("e{i}")), &subscription, &cancel)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some());
    }
    assert_eq!(receiver.hits(), 3);
    assert_eq!(notifier.breaker_state(&url), Some(CircuitState::Open));

    // The next delivery is rejected without touching the network.
    let err = notifier
        .notify_with_retry(&event("e3"), &subscription, &cancel)
        .await
        .unwrap_err();
    assert_eq!(receiver.hits(), 3);
    assert!(err.to_string().contains("circuit"));
}

#[tokio::test]
async fn test_open_circuit_rejection_consumes_attempts() {
    let (url, receiver) =
        Receiver::spawn(vec![], StatusCode::INTERNAL_SERVER_ERROR).await;
    let notifier = WebhookNotifier::new(fast_notifier_config()).unwrap();
    let subscription = subscription("s1", &url);
    let cancel = CancellationToken::new();

    // First delivery: three real attempts, breaker opens on the third.
    let _ = notifier
        .notify_with_retry(&event("e1"), &subscription, &cancel)
        .await
        .unwrap_err();
    assert_eq!(receiver.hits(), 3);

    // Second delivery: all three attempts are breaker rejections and the
    // delivery still terminates as failed.
    let err = notifier
        .notify_with_retry(&event("e2"), &subscription, &cancel)
        .await
        .unwrap_err();
    assert_eq!(receiver.hits(), 3);
    match err.downcast_ref::<Error>() {
        Some(Error::DeliveryFailed { attempts, .. }) => assert_eq!(*attempts, 3),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_during_backoff_finalizes_failed() {
    let (url, _receiver) =
        Receiver::spawn(vec![], StatusCode::INTERNAL_SERVER_ERROR).await;
    let mut config = fast_notifier_config();
    config.initial_backoff = Duration::from_secs(60);
    config.max_backoff = Duration::from_secs(60);
    let tracker = Arc::new(InMemoryDeliveryTracker::new());
    let notifier = WebhookNotifier::new(config)
        .unwrap()
        .with_tracker(tracker.clone());
    let cancel = CancellationToken::new();

    let cancel_soon = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_soon.cancel();
    });

    let err = notifier
        .notify_with_retry(&event("e1"), &subscription("s1", &url), &cancel)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cancelled"));

    let records = tracker.list_by_event("e1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeliveryStatus::Failed);
    assert!(records[0].completed_at.is_some());
}

/// Scripted watcher for driving the full pipeline.
struct ScriptedWatcher {
    batches: Mutex<VecDeque<Vec<WatchEvent>>>,
}

#[async_trait]
impl BackendWatcher for ScriptedWatcher {
    async fn watch(&self) -> Result<BoxStream<'static, WatchEvent>> {
        match self.batches.lock().unwrap().pop_front() {
            Some(batch) => Ok(futures::stream::iter(batch).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

struct EchoResolver;

#[async_trait]
impl ResourceResolver for EchoResolver {
    async fn resolve(&self, resource: &ResourceRef) -> Result<Option<serde_json::Value>> {
        Ok(Some(serde_json::json!({"resourceId": resource.entity_id})))
    }
}

#[tokio::test]
async fn test_full_pipeline_filters_by_pool() {
    let (url_p1, receiver_p1) = Receiver::spawn(vec![], StatusCode::NO_CONTENT).await;
    let (url_p2, receiver_p2) = Receiver::spawn(vec![], StatusCode::NO_CONTENT).await;

    let filter = Arc::new(CriteriaFilter::new());
    filter.upsert(Subscription {
        criteria: SubscriptionCriteria {
            pool_ids: vec!["p1".to_string()],
            ..Default::default()
        },
        ..subscription("sub-p1", &url_p1)
    });
    filter.upsert(Subscription {
        criteria: SubscriptionCriteria {
            pool_ids: vec!["p2".to_string()],
            ..Default::default()
        },
        ..subscription("sub-p2", &url_p2)
    });

    let mut resource = ResourceRef::new(EntityKind::Resource, "n1");
    resource.pool_id = Some("p1".to_string());
    let watcher = ScriptedWatcher {
        batches: Mutex::new(VecDeque::from([vec![WatchEvent::Added(resource)]])),
    };

    let generator = Arc::new(EventGenerator::with_config(
        Arc::new(watcher),
        Arc::new(EchoResolver),
        GeneratorConfig {
            channel_capacity: 16,
            reconnect_backoff: Duration::from_millis(10),
        },
    ));
    let queue = Arc::new(InMemoryEventQueue::new());
    let tracker = Arc::new(InMemoryDeliveryTracker::new());
    let notifier = Arc::new(
        WebhookNotifier::new(fast_notifier_config())
            .unwrap()
            .with_tracker(tracker.clone()),
    );
    let processor = EventProcessor::new(
        generator,
        queue.clone(),
        filter,
        notifier,
        ProcessorConfig {
            workers: 3,
            consumer_group: "pipeline-test".to_string(),
        },
    );
    processor.start().await.unwrap();

    for _ in 0..100 {
        if receiver_p1.hits() == 1 && queue.pending_count("pipeline-test") == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Only the pool-p1 subscriber was notified, and the entry was
    // acknowledged after delivery.
    assert_eq!(receiver_p1.hits(), 1);
    assert_eq!(receiver_p2.hits(), 0);
    assert_eq!(queue.pending_count("pipeline-test"), 0);

    let deliveries = tracker.list_by_subscription("sub-p1").await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);

    processor.stop().await;
}

#[tokio::test]
async fn test_failed_delivery_does_not_block_other_subscribers() {
    let (url_good, receiver_good) = Receiver::spawn(vec![], StatusCode::NO_CONTENT).await;
    let (url_bad, receiver_bad) =
        Receiver::spawn(vec![], StatusCode::INTERNAL_SERVER_ERROR).await;

    let filter = Arc::new(CriteriaFilter::new());
    // IDs chosen so the failing subscription sorts first.
    filter.upsert(subscription("a-bad", &url_bad));
    filter.upsert(subscription("b-good", &url_good));

    let watcher = ScriptedWatcher {
        batches: Mutex::new(VecDeque::from([vec![WatchEvent::Added(
            ResourceRef::new(EntityKind::Resource, "n1"),
        )]])),
    };
    let generator = Arc::new(EventGenerator::with_config(
        Arc::new(watcher),
        Arc::new(EchoResolver),
        GeneratorConfig {
            channel_capacity: 16,
            reconnect_backoff: Duration::from_millis(10),
        },
    ));
    let queue = Arc::new(InMemoryEventQueue::new());
    let notifier = Arc::new(WebhookNotifier::new(fast_notifier_config()).unwrap());
    let processor = EventProcessor::new(
        generator,
        queue.clone(),
        filter,
        notifier,
        ProcessorConfig {
            workers: 1,
            consumer_group: "pipeline-test".to_string(),
        },
    );
    processor.start().await.unwrap();

    for _ in 0..100 {
        if receiver_good.hits() == 1 && queue.pending_count("pipeline-test") == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(receiver_bad.hits(), 3);
    assert_eq!(receiver_good.hits(), 1);
    assert_eq!(queue.pending_count("pipeline-test"), 0);

    processor.stop().await;
}

#[tokio::test]
async fn test_notification_payload_shape() {
    let (url, _) = Receiver::spawn(vec![], StatusCode::NO_CONTENT).await;
    let subscription = subscription("s1", &url);
    let event = event("e1");

    let payload = notifications::NotificationPayload::build(&event, &subscription);
    let json = serde_json::to_value(&payload).unwrap();

    assert_eq!(json["subscriptionId"], "s1");
    assert_eq!(json["consumerSubscriptionId"], "consumer-s1");
    assert_eq!(json["eventType"], "created");
    assert_eq!(json["resource"]["resourceId"], "n1");
    assert!(json["timestamp"].is_string());
}
