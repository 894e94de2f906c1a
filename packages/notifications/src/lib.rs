//! Resource-change notification pipeline for the inventory gateway.
//!
//! Backend changes flow through five stages, each behind a trait seam so
//! deployments can swap implementations:
//!
//! ```text
//! backend watch ─► EventGenerator ─► EventQueue ─► EventProcessor workers
//!                                                      │ SubscriptionFilter
//!                                                      ▼
//!                                                WebhookNotifier ─► DeliveryTracker
//! ```
//!
//! The queue gives at-least-once semantics via consumer groups and explicit
//! acknowledgment; the notifier retries with exponential backoff behind a
//! per-endpoint circuit breaker; the tracker records every delivery status
//! transition. `notifyd` is the daemon wiring the Redis- and NATS-backed
//! implementations together.

pub mod config;
pub mod error;
pub mod filter;
pub mod generator;
pub mod model;
pub mod notifier;
pub mod processor;
pub mod queue;
pub mod tracker;

pub use config::{
    BreakerConfig, GeneratorConfig, NotifierConfig, ProcessorConfig, Settings, TransportConfig,
};
pub use error::Error;
pub use filter::{CriteriaFilter, SubscriptionFilter};
pub use generator::{
    BackendWatcher, EventGenerator, NatsBackendWatcher, ResourceRef, ResourceResolver, WatchEvent,
};
pub use model::{
    DeliveryStatus, EntityKind, Event, EventType, NotificationDelivery, NotificationPayload,
    Subscription, SubscriptionCriteria,
};
pub use notifier::{CircuitBreaker, CircuitState, WebhookNotifier};
pub use processor::EventProcessor;
pub use queue::{EventQueue, InMemoryEventQueue, QueueEntry, RedisEventQueue};
pub use tracker::{DeliveryTracker, InMemoryDeliveryTracker, RedisDeliveryTracker};
