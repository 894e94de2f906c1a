//! Webhook delivery with retry, backoff, and per-endpoint circuit breaking.
//!
//! `WebhookNotifier` delivers one event to one subscription's callback URL.
//! `notify_with_retry` runs the full delivery sequence, persisting the
//! `NotificationDelivery` record through the tracker on every status
//! transition:
//!
//! ```text
//! Pending ─► Delivering ─► Delivered            (2xx)
//!                │
//!                ├─► Retrying ─► Delivering ...  (backoff: 1s ×2, cap 60s)
//!                └─► Failed                      (budget exhausted / cancel)
//! ```
//!
//! A circuit-open rejection consumes a retry attempt exactly like a network
//! failure does.

mod breaker;
mod transport;

pub use breaker::{CircuitBreaker, CircuitState};
pub use transport::{USER_AGENT, build_client};

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NotifierConfig;
use crate::error::Error;
use crate::model::{
    DeliveryStatus, Event, NotificationDelivery, NotificationPayload, Subscription,
};
use crate::tracker::DeliveryTracker;

/// Longest response-body excerpt carried into a delivery error.
const ERROR_BODY_LIMIT: usize = 512;

/// Outcome of a single HTTP attempt.
enum AttemptOutcome {
    Success {
        status: u16,
        millis: u64,
    },
    Failure {
        status: Option<u16>,
        millis: Option<u64>,
        error: anyhow::Error,
    },
}

/// Delivers events to subscription callback endpoints.
///
/// Shared across all processor workers: the HTTP client is reused and the
/// circuit breakers live in a concurrent map keyed by callback URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: NotifierConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    tracker: Option<Arc<dyn DeliveryTracker>>,
}

impl WebhookNotifier {
    /// Build a notifier without delivery tracking.
    pub fn new(config: NotifierConfig) -> Result<Self> {
        let client = build_client(&config.transport)?;
        Ok(Self {
            client,
            config,
            breakers: DashMap::new(),
            tracker: None,
        })
    }

    /// Attach a delivery tracker. Tracking is non-blocking instrumentation:
    /// persistence failures are logged and never abort a delivery.
    pub fn with_tracker(mut self, tracker: Arc<dyn DeliveryTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Deliver once, no retry. 2xx is success; anything else is an error
    /// with the response body captured when available.
    pub async fn notify(&self, event: &Event, subscription: &Subscription) -> Result<()> {
        validate(event, subscription)?;
        let payload = NotificationPayload::build(event, subscription);
        match self.execute_attempt(&subscription.callback_url, &payload).await {
            AttemptOutcome::Success { .. } => Ok(()),
            AttemptOutcome::Failure { error, .. } => Err(error),
        }
    }

    /// Run the full delivery sequence for one (event, subscription) pair.
    ///
    /// Returns the final delivery record on success, or an error wrapping
    /// the last failure once the attempt budget is exhausted. Cancellation
    /// during a retry backoff finalizes the record as Failed so tracking
    /// state always reflects what was actually attempted.
    pub async fn notify_with_retry(
        &self,
        event: &Event,
        subscription: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<NotificationDelivery> {
        validate(event, subscription)?;

        let payload = NotificationPayload::build(event, subscription);
        let mut delivery = NotificationDelivery::new(
            &event.id,
            &subscription.id,
            &subscription.callback_url,
            self.config.max_attempts,
        );

        for attempt in 1..=self.config.max_attempts {
            delivery.status = DeliveryStatus::Delivering;
            delivery.attempts = attempt;
            delivery.last_attempt_at = Some(chrono::Utc::now());
            self.track(&delivery).await;

            let outcome = self
                .execute_attempt(&subscription.callback_url, &payload)
                .await;

            match outcome {
                AttemptOutcome::Success { status, millis } => {
                    delivery.http_status_code = Some(status);
                    delivery.response_time_millis = Some(millis);
                    delivery.last_error = None;
                    delivery.complete(DeliveryStatus::Delivered);
                    self.track(&delivery).await;
                    info!(
                        event_id = %event.id,
                        subscription_id = %subscription.id,
                        attempt,
                        response_ms = millis,
                        "notification delivered"
                    );
                    return Ok(delivery);
                }
                AttemptOutcome::Failure {
                    status,
                    millis,
                    error,
                } => {
                    delivery.http_status_code = status;
                    delivery.response_time_millis = millis;
                    delivery.last_error = Some(error.to_string());

                    if attempt == self.config.max_attempts {
                        delivery.complete(DeliveryStatus::Failed);
                        self.track(&delivery).await;
                        warn!(
                            event_id = %event.id,
                            subscription_id = %subscription.id,
                            attempts = attempt,
                            error = %error,
                            "notification failed, attempt budget exhausted"
                        );
                        return Err(error.context(Error::DeliveryFailed {
                            attempts: attempt,
                            last_error: delivery.last_error.clone().unwrap_or_default(),
                        }));
                    }

                    let delay = self.backoff_delay(attempt);
                    delivery.status = DeliveryStatus::Retrying;
                    delivery.next_attempt_at =
                        Some(chrono::Utc::now() + chrono::Duration::from_std(delay)?);
                    self.track(&delivery).await;
                    debug!(
                        event_id = %event.id,
                        subscription_id = %subscription.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "notification attempt failed, backing off"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            delivery.last_error = Some("delivery cancelled during retry backoff".to_string());
                            delivery.complete(DeliveryStatus::Failed);
                            self.track(&delivery).await;
                            return Err(anyhow!(Error::DeliveryFailed {
                                attempts: attempt,
                                last_error: "delivery cancelled during retry backoff".to_string(),
                            }));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        unreachable!("retry loop returns on every terminal path")
    }

    /// Exponential backoff before the attempt after `attempt`:
    /// initial × 2^(attempt-1), capped at the configured maximum.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self
            .config
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.config.max_backoff)
    }

    /// Run one attempt through the endpoint's circuit breaker.
    async fn execute_attempt(&self, url: &str, payload: &NotificationPayload) -> AttemptOutcome {
        let breaker = self.breaker_for(url);

        if !breaker.allow_request() {
            return AttemptOutcome::Failure {
                status: None,
                millis: None,
                error: anyhow!(Error::CircuitOpen {
                    url: url.to_string(),
                }),
            };
        }

        let started = Instant::now();
        match self.client.post(url).json(payload).send().await {
            Ok(response) => {
                let millis = started.elapsed().as_millis() as u64;
                let status = response.status();
                if status.is_success() {
                    breaker.record_success();
                    AttemptOutcome::Success {
                        status: status.as_u16(),
                        millis,
                    }
                } else {
                    breaker.record_failure();
                    let mut body = response.text().await.unwrap_or_default();
                    body.truncate(ERROR_BODY_LIMIT);
                    AttemptOutcome::Failure {
                        status: Some(status.as_u16()),
                        millis: Some(millis),
                        error: anyhow!("webhook endpoint returned {status}: {body}"),
                    }
                }
            }
            Err(e) => {
                breaker.record_failure();
                AttemptOutcome::Failure {
                    status: None,
                    millis: Some(started.elapsed().as_millis() as u64),
                    error: anyhow::Error::new(e).context(format!("webhook request to {url} failed")),
                }
            }
        }
    }

    /// Fetch or lazily create the breaker for a callback URL.
    fn breaker_for(&self, url: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(url, self.config.breaker.clone())))
            .value()
            .clone()
    }

    /// Current breaker state for an endpoint, if one exists yet.
    pub fn breaker_state(&self, url: &str) -> Option<CircuitState> {
        self.breakers.get(url).map(|b| b.state())
    }

    async fn track(&self, delivery: &NotificationDelivery) {
        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker.track(delivery).await {
                warn!(delivery_id = %delivery.id, error = %e, "failed to persist delivery record");
            }
        }
    }
}

fn validate(event: &Event, subscription: &Subscription) -> Result<()> {
    if event.id.is_empty() {
        return Err(anyhow!(Error::Validation("event has an empty ID".into())));
    }
    if subscription.id.is_empty() {
        return Err(anyhow!(Error::Validation(
            "subscription has an empty ID".into()
        )));
    }
    if subscription.callback_url.is_empty() {
        return Err(anyhow!(Error::Validation(
            "subscription has an empty callback URL".into()
        )));
    }
    Ok(())
}
