//! Circuit breaker for downstream service calls.
//!
//! The engine wraps every call it makes to a downstream dependency (driver
//! profile lookups, dispatch notifications, ...) in a breaker so that a
//! degraded dependency sheds load fast instead of accumulating latency and
//! cascading retries inside the lifecycle engine.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    /// Calls flow normally; failures accumulate in the rolling window.
    Closed = 0,
    /// Calls are rejected immediately until the open timeout elapses.
    Open = 1,
    /// A bounded number of trial calls probe whether the dependency
    /// recovered.
    HalfOpen = 2,
}

impl From<u8> for BreakerState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            2 => Self::HalfOpen,
            // Default to the safest state
            _ => Self::Open,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Length of the counting window; counters reset every interval.
    pub interval: Duration,
    /// How long the breaker stays OPEN before probing again.
    pub timeout: Duration,
    /// Minimum calls in the window before the failure ratio is considered.
    pub min_requests: u64,
    /// Failure ratio (failures / total, in [0, 1]) that trips the breaker.
    pub failure_ratio: f64,
    /// Trial budget while HALF_OPEN: this many consecutive successes close
    /// the breaker, and no more than this many trials are admitted at once.
    pub max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            min_requests: 10,
            failure_ratio: 0.5,
            max_requests: 3,
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the wrapped call was not invoked.
    #[error("circuit open; call rejected")]
    Open,
    /// The wrapped call ran and failed; the failure was recorded.
    #[error("downstream call failed: {0}")]
    Service(E),
}

/// Counters for the current fixed window.
#[derive(Debug)]
struct Window {
    started_at: Instant,
    total: u64,
    failures: u64,
}

impl Window {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total: 0,
            failures: 0,
        }
    }

    fn record(&mut self, success: bool, interval: Duration) {
        if self.started_at.elapsed() >= interval {
            self.started_at = Instant::now();
            self.total = 0;
            self.failures = 0;
        }
        self.total += 1;
        if !success {
            self.failures += 1;
        }
    }
}

/// Trial accounting while HALF_OPEN.
#[derive(Debug, Default)]
struct Trial {
    admitted: u32,
    successes: u32,
}

/// A three-state circuit breaker guarding one downstream dependency.
///
/// Each dependency gets its own breaker instance; there is no process-wide
/// registry.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    window: Mutex<Window>,
    trial: Mutex<Trial>,
    opened_at: RwLock<Option<Instant>>,
    last_failure: RwLock<Option<String>>,
}

impl CircuitBreaker {
    /// Creates a breaker with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(BreakerState::Closed as u8),
            window: Mutex::new(Window::new()),
            trial: Mutex::new(Trial::default()),
            opened_at: RwLock::new(None),
            last_failure: RwLock::new(None),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> BreakerState {
        BreakerState::from(self.state.load(Ordering::Acquire))
    }

    /// Returns the most recent failure message, if any.
    pub async fn last_failure(&self) -> Option<String> {
        self.last_failure.read().await.clone()
    }

    /// Executes an operation through the breaker.
    ///
    /// While OPEN the operation is not invoked at all; the call fails fast
    /// with [`BreakerError::Open`]. Otherwise the operation runs and its
    /// outcome feeds the breaker's counters.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let trial_call = self.admit().await?;

        match operation().await {
            Ok(value) => {
                self.record_success(trial_call).await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure(trial_call, &err.to_string()).await;
                Err(BreakerError::Service(err))
            }
        }
    }

    /// Manually resets the breaker to CLOSED.
    pub async fn reset(&self) {
        debug!("manually resetting circuit breaker");
        self.transition_to_closed().await;
        *self.opened_at.write().await = None;
        *self.last_failure.write().await = None;
    }

    /// Forces the breaker OPEN (operator intervention or tests).
    pub async fn force_open(&self) {
        warn!("manually forcing circuit breaker open");
        self.transition_to_open().await;
        *self.last_failure.write().await = Some("manually forced open".to_string());
    }

    /// Decides whether a call may proceed; `Ok(true)` means it counts as a
    /// HALF_OPEN trial.
    async fn admit<E>(&self) -> Result<bool, BreakerError<E>> {
        match self.state() {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                let opened_at = *self.opened_at.read().await;
                match opened_at {
                    Some(instant) if instant.elapsed() >= self.config.timeout => {
                        debug!("circuit breaker transitioning from Open to HalfOpen");
                        self.transition_to_half_open().await;
                        let mut trial = self.trial.lock().await;
                        trial.admitted += 1;
                        Ok(true)
                    }
                    _ => Err(BreakerError::Open),
                }
            }
            BreakerState::HalfOpen => {
                let mut trial = self.trial.lock().await;
                if trial.admitted < self.config.max_requests {
                    trial.admitted += 1;
                    Ok(true)
                } else {
                    Err(BreakerError::Open)
                }
            }
        }
    }

    async fn record_success(&self, trial_call: bool) {
        match self.state() {
            BreakerState::HalfOpen if trial_call => {
                let successes = {
                    let mut trial = self.trial.lock().await;
                    trial.successes += 1;
                    trial.successes
                };
                debug!(successes, "circuit breaker half-open trial succeeded");
                if successes >= self.config.max_requests {
                    debug!("circuit breaker transitioning from HalfOpen to Closed");
                    self.transition_to_closed().await;
                }
            }
            BreakerState::Closed => {
                let should_trip = {
                    let mut window = self.window.lock().await;
                    window.record(true, self.config.interval);
                    window.total >= self.config.min_requests
                        && failure_ratio(window.failures, window.total)
                            >= self.config.failure_ratio
                };
                // A success can still cross min_requests with the ratio
                // already over the threshold.
                if should_trip {
                    warn!("circuit breaker opening: failure ratio threshold reached");
                    self.transition_to_open().await;
                }
            }
            _ => {}
        }
    }

    async fn record_failure(&self, trial_call: bool, message: &str) {
        *self.last_failure.write().await = Some(message.to_string());

        match self.state() {
            BreakerState::HalfOpen if trial_call => {
                debug!("circuit breaker reopening after half-open trial failure");
                self.transition_to_open().await;
            }
            BreakerState::Closed => {
                let should_trip = {
                    let mut window = self.window.lock().await;
                    window.record(false, self.config.interval);
                    window.total >= self.config.min_requests
                        && failure_ratio(window.failures, window.total)
                            >= self.config.failure_ratio
                };
                if should_trip {
                    warn!("circuit breaker opening: failure ratio threshold reached");
                    self.transition_to_open().await;
                }
            }
            _ => {}
        }
    }

    async fn transition_to_closed(&self) {
        self.state
            .store(BreakerState::Closed as u8, Ordering::Release);
        *self.window.lock().await = Window::new();
        *self.trial.lock().await = Trial::default();
        debug!("circuit breaker state changed to Closed");
    }

    async fn transition_to_open(&self) {
        self.state.store(BreakerState::Open as u8, Ordering::Release);
        *self.opened_at.write().await = Some(Instant::now());
        *self.trial.lock().await = Trial::default();
        error!("circuit breaker state changed to Open");
    }

    async fn transition_to_half_open(&self) {
        self.state
            .store(BreakerState::HalfOpen as u8, Ordering::Release);
        *self.trial.lock().await = Trial::default();
        debug!("circuit breaker state changed to HalfOpen");
    }
}

#[allow(clippy::cast_precision_loss)]
fn failure_ratio(failures: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    failures as f64 / total as f64
}
