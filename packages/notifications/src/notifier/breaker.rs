//! Per-endpoint circuit breaker.
//!
//! Isolates consistently failing callback URLs: after a run of consecutive
//! failures the circuit opens and requests fail fast without touching the
//! network; after a cool-down a limited number of probes is admitted, and a
//! single probe success closes the circuit again.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::BreakerConfig;

/// Circuit state, reported on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    Closed,
    /// Requests are rejected until the cool-down elapses.
    Open,
    /// Limited probes allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

/// Circuit breaker for one callback endpoint.
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_calls: 0,
            }),
        }
    }

    /// Current state, accounting for an elapsed cool-down.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        state.state
    }

    /// Returns true if a request may proceed. Half-open admissions count
    /// against the probe quota.
    pub fn allow_request(&self) -> bool {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if state.half_open_calls < self.config.half_open_max_calls {
                    state.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful request. A half-open success closes the circuit.
    pub fn record_success(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(endpoint = %self.endpoint, state = %CircuitState::Closed, "circuit closed, endpoint recovered");
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.half_open_calls = 0;
                state.opened_at = None;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed request. Opens the circuit at the failure threshold;
    /// any half-open failure reopens it.
    pub fn record_failure(&self) {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                debug!(
                    endpoint = %self.endpoint,
                    failures = state.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "delivery failure recorded"
                );
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(endpoint = %self.endpoint, state = %CircuitState::Open, "circuit opened");
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(endpoint = %self.endpoint, state = %CircuitState::Open, "circuit reopened from half-open");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.half_open_calls = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn maybe_half_open(&self, state: &mut BreakerState) {
        if state.state != CircuitState::Open {
            return;
        }
        let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
        if elapsed >= self.config.cool_down {
            info!(endpoint = %self.endpoint, state = %CircuitState::HalfOpen, "circuit half-open, admitting probes");
            state.state = CircuitState::HalfOpen;
            state.half_open_calls = 0;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
