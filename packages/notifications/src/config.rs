//! Environment-driven configuration.
//!
//! Every component takes a plain config struct with sensible defaults;
//! `Settings::from_env()` assembles them for the daemon from environment
//! variables (loaded from `.env` by the binary via dotenvy).

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// HTTP transport settings for webhook delivery.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Client certificate PEM path for mutual TLS.
    pub tls_cert_path: Option<String>,
    /// Client key PEM path for mutual TLS.
    pub tls_key_path: Option<String>,
    /// Additional CA bundle PEM path.
    pub tls_ca_path: Option<String>,
    /// Disable server certificate verification. Never the default; enabling
    /// it logs a security warning.
    pub insecure_skip_verify: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
            insecure_skip_verify: false,
        }
    }
}

/// Circuit breaker thresholds, per callback URL.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cool-down before an open circuit admits probe requests.
    pub cool_down: Duration,
    /// Probe quota while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cool_down: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Retry policy for webhook delivery.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Total attempts per delivery, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub initial_backoff: Duration,
    /// Upper bound on the backoff delay.
    pub max_backoff: Duration,
    pub transport: TransportConfig,
    pub breaker: BreakerConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            transport: TransportConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Generator channel and reconnect behavior.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Bounded capacity of the event channel; a full channel drops events.
    pub channel_capacity: usize,
    /// Fixed backoff between watch reconnect attempts.
    pub reconnect_backoff: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// Worker pool and consumer group settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of queue workers.
    pub workers: usize,
    /// Shared consumer group name; each worker gets a unique consumer name.
    pub consumer_group: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            consumer_group: "inventory-notifications".to_string(),
        }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub redis_url: String,
    pub nats_url: String,
    /// NATS subject carrying backend change notices.
    pub watch_subject: String,
    pub notifier: NotifierConfig,
    pub generator: GeneratorConfig,
    pub processor: ProcessorConfig,
}

impl Settings {
    /// Assemble settings from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut notifier = NotifierConfig::default();
        if let Some(v) = read_var("NOTIFICATION_MAX_ATTEMPTS")? {
            notifier.max_attempts = v
                .parse()
                .context("NOTIFICATION_MAX_ATTEMPTS must be an integer")?;
        }
        if let Some(v) = read_var("NOTIFICATION_HTTP_TIMEOUT_SECS")? {
            notifier.transport.timeout = Duration::from_secs(
                v.parse()
                    .context("NOTIFICATION_HTTP_TIMEOUT_SECS must be an integer")?,
            );
        }
        notifier.transport.tls_cert_path = read_var("NOTIFICATION_TLS_CERT")?;
        notifier.transport.tls_key_path = read_var("NOTIFICATION_TLS_KEY")?;
        notifier.transport.tls_ca_path = read_var("NOTIFICATION_TLS_CA")?;
        if let Some(v) = read_var("NOTIFICATION_INSECURE_SKIP_VERIFY")? {
            notifier.transport.insecure_skip_verify = v
                .parse()
                .context("NOTIFICATION_INSECURE_SKIP_VERIFY must be true or false")?;
        }

        let mut processor = ProcessorConfig::default();
        if let Some(v) = read_var("NOTIFICATION_WORKERS")? {
            processor.workers = v.parse().context("NOTIFICATION_WORKERS must be an integer")?;
        }
        if let Some(v) = read_var("NOTIFICATION_CONSUMER_GROUP")? {
            processor.consumer_group = v;
        }

        Ok(Self {
            redis_url: read_var("REDIS_URL")?
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            nats_url: read_var("NATS_URL")?.unwrap_or_else(|| "nats://127.0.0.1:4222".to_string()),
            watch_subject: read_var("NOTIFICATION_WATCH_SUBJECT")?
                .unwrap_or_else(|| "inventory.changes".to_string()),
            notifier,
            generator: GeneratorConfig::default(),
            processor,
        })
    }
}

/// Read an env var, treating empty values as unset.
fn read_var(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pipeline_constants() {
        let notifier = NotifierConfig::default();
        assert_eq!(notifier.max_attempts, 3);
        assert_eq!(notifier.initial_backoff, Duration::from_secs(1));
        assert_eq!(notifier.max_backoff, Duration::from_secs(60));
        assert!(!notifier.transport.insecure_skip_verify);

        let breaker = BreakerConfig::default();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.cool_down, Duration::from_secs(30));
        assert_eq!(breaker.half_open_max_calls, 3);

        let generator = GeneratorConfig::default();
        assert_eq!(generator.channel_capacity, 100);
        assert_eq!(generator.reconnect_backoff, Duration::from_secs(5));

        let processor = ProcessorConfig::default();
        assert_eq!(processor.workers, 5);
    }
}
