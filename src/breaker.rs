//! Circuit Breaker
//!
//! Stops calling a dependency (the durable cache store, the computational API)
//! after repeated failures and probes it again after a cooldown.
//!
//! ## States
//! - **Closed**: Normal operation, calls flow through
//! - **Open**: Dependency failing, calls rejected immediately
//! - **Half-Open**: Cooldown elapsed, calls allowed to test recovery
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_math_cascade::breaker::{CircuitBreaker, CircuitBreakerError};
//! # #[tokio::main]
//! # async fn main() {
//! let breaker = CircuitBreaker::new("durable_store", 3, 0.5, Duration::from_secs(30));
//!
//! match breaker.call(|| async { Ok::<&str, &str>("written") }).await {
//!     Ok(result) => println!("{result}"),
//!     Err(CircuitBreakerError::Open) => {
//!         // skip the dependency, degrade gracefully
//!     }
//!     Err(CircuitBreakerError::Failed(e)) => eprintln!("call failed: {e}"),
//! }
//! # }
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WINDOW_SIZE: usize = 100;

/// Circuit breaker shared by clones.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<Mutex<CircuitState>>,
    config: CircuitBreakerConfig,
}

#[derive(Debug, Clone)]
struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    failure_threshold: usize,
    /// Success rate (0.0 - 1.0) over post-recovery calls needed to close
    success_threshold: f64,
    /// Time spent open before probing
    cooldown: Duration,
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    failures: usize,
    successes: usize,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    /// Recent results (true = success)
    recent_results: VecDeque<bool>,
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Calls flow through normally.
    Closed,
    /// Calls are rejected without touching the dependency.
    Open,
    /// Calls are let through to test whether the dependency recovered.
    HalfOpen,
}

impl CircuitStatus {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker errors
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, call rejected
    Open,
    /// The wrapped call failed
    Failed(E),
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    ///
    /// # Arguments
    /// * `name` - label used in log lines
    /// * `failure_threshold` - consecutive failures before opening
    /// * `success_threshold` - success rate (0.0-1.0) needed to close again
    /// * `cooldown` - time spent open before probing recovery
    pub fn new(
        name: &str,
        failure_threshold: usize,
        success_threshold: f64,
        cooldown: Duration,
    ) -> Self {
        Self {
            name: Arc::from(name),
            state: Arc::new(Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                failures: 0,
                successes: 0,
                last_failure_time: None,
                last_state_change: Instant::now(),
                recent_results: VecDeque::with_capacity(WINDOW_SIZE),
            })),
            config: CircuitBreakerConfig {
                failure_threshold: failure_threshold.max(1),
                success_threshold,
                cooldown,
            },
        }
    }

    /// Execute `f` through the breaker.
    ///
    /// `Err` results count as failures; map expected application errors to
    /// `Ok` before handing them in if they should not trip the circuit.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(CircuitBreakerError::Open);
        }

        let result = f().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }

        result.map_err(CircuitBreakerError::Failed)
    }

    /// Ask whether a call may proceed right now. Moves an open circuit whose
    /// cooldown has elapsed to half-open.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        match state.status {
            CircuitStatus::Open => {
                let cooled = state
                    .last_failure_time
                    .map_or(true, |t| t.elapsed() >= self.config.cooldown);
                if cooled {
                    // success rate is judged only on post-recovery calls
                    state.status = CircuitStatus::HalfOpen;
                    state.recent_results.clear();
                    state.last_state_change = Instant::now();
                    info!(breaker = %self.name, "circuit breaker: transitioning to half-open");
                    true
                } else {
                    debug!(breaker = %self.name, "circuit breaker: call rejected (open)");
                    false
                }
            }
            CircuitStatus::HalfOpen | CircuitStatus::Closed => true,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock();

        state.successes += 1;
        push_result(&mut state.recent_results, true);

        match state.status {
            CircuitStatus::HalfOpen => {
                let success_rate = success_rate(&state.recent_results);
                if success_rate >= self.config.success_threshold {
                    state.status = CircuitStatus::Closed;
                    state.failures = 0;
                    state.last_state_change = Instant::now();
                    info!(
                        breaker = %self.name,
                        success_rate,
                        "circuit breaker: closing (dependency recovered)"
                    );
                }
            }
            CircuitStatus::Closed => state.failures = 0,
            CircuitStatus::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();

        state.failures += 1;
        state.last_failure_time = Some(Instant::now());
        push_result(&mut state.recent_results, false);

        match state.status {
            CircuitStatus::Closed => {
                if state.failures >= self.config.failure_threshold {
                    state.status = CircuitStatus::Open;
                    state.last_state_change = Instant::now();
                    warn!(
                        breaker = %self.name,
                        failures = state.failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker: opening (threshold exceeded)"
                    );
                } else {
                    debug!(
                        breaker = %self.name,
                        failures = state.failures,
                        "circuit breaker: failure recorded"
                    );
                }
            }
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.last_state_change = Instant::now();
                warn!(breaker = %self.name, "circuit breaker: reopening (probe failed)");
            }
            CircuitStatus::Open => {}
        }
    }

    /// Current circuit status.
    pub fn status(&self) -> CircuitStatus {
        self.state.lock().status
    }

    /// Snapshot of the breaker's counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            status: state.status,
            failures: state.failures,
            successes: state.successes,
            success_rate: success_rate(&state.recent_results),
            time_in_current_state: state.last_state_change.elapsed(),
        }
    }

    /// Force the circuit open (maintenance, tests).
    pub fn trip(&self) {
        let mut state = self.state.lock();
        state.status = CircuitStatus::Open;
        state.last_failure_time = Some(Instant::now());
        state.last_state_change = Instant::now();
        warn!(breaker = %self.name, "circuit breaker: manually tripped to open");
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

fn push_result(window: &mut VecDeque<bool>, ok: bool) {
    if window.len() == WINDOW_SIZE {
        window.pop_front();
    }
    window.push_back(ok);
}

fn success_rate(window: &VecDeque<bool>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let successes = window.iter().filter(|&&x| x).count();
    successes as f64 / window.len() as f64
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub status: CircuitStatus,
    /// Consecutive failures counted toward opening.
    pub failures: usize,
    /// Total successes recorded.
    pub successes: usize,
    /// Fraction of recent calls that succeeded (0.0 – 1.0).
    pub success_rate: f64,
    /// Wall-clock time spent in the current state.
    pub time_in_current_state: Duration,
}
