//! Circuit breaker
//!
//! A local, timer-free circuit breaker. The Open → HalfOpen transition is
//! checked lazily inside [`CircuitBreaker::allow`] and
//! [`CircuitBreaker::acquire`], so a breaker never owns a background task.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if service recovered - a single trial call allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ──────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘ ◄────────────── └──────────┘
///      ▲                                        trial failure       │
///      │                                                            │
///      │                      trial success                         │
///      └────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use taskgate_engine::reliability::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_reset_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,

    /// Sliding window size for failure counting
    #[serde(with = "duration_millis")]
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            window_size: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout (time before trying again after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the sliding window size for failure counting
    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }
}

/// Error types for circuit breaker operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, calls are not allowed
    #[error("circuit breaker is open")]
    Open,

    /// Circuit is half-open and the trial call is already in flight
    #[error("circuit breaker half-open, trial call in flight")]
    HalfOpenTrialInFlight,
}

type TransitionHook = Box<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
    trial_in_flight: bool,
    // Trial in flight was admitted through `allow`
    direct_trial: bool,
    // Bumped on every half-open period and on reset
    generation: u64,
}

/// Who reports an outcome
#[derive(Debug, Clone, Copy)]
enum Reporter {
    /// A permit; `Some(generation)` for a half-open trial
    Permit(Option<u64>),
    /// `record_success`/`record_failure`
    Direct,
}

impl BreakerState {
    fn owns_trial(&self, reporter: Reporter) -> bool {
        self.trial_in_flight
            && match reporter {
                Reporter::Permit(trial) => trial == Some(self.generation),
                Reporter::Direct => self.direct_trial,
            }
    }

    fn start_trial(&mut self, direct: bool) -> u64 {
        self.trial_in_flight = true;
        self.direct_trial = direct;
        self.generation
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn move_to(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        self.state = to;
        (from != to).then_some((from, to))
    }
}

/// Permit that must be held during a protected call
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping an unreported trial permit frees the
/// trial slot without changing state.
///
/// A trial permit belongs to the half-open period that issued it. Once that
/// period ends (trial reported elsewhere, [`CircuitBreaker::reset`]) its
/// outcome and its drop no longer affect the breaker.
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    trial: Option<u64>,
    reported: bool,
}

impl CircuitPermit {
    /// Whether this permit is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    /// Report the call succeeded
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_outcome(true, Reporter::Permit(self.trial));
    }

    /// Report the call failed
    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_outcome(false, Reporter::Permit(self.trial));
    }

    /// Report a call outcome from its result
    pub fn record<T, E>(self, result: &Result<T, E>) {
        if result.is_ok() {
            self.success();
        } else {
            self.failure();
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if let (false, Some(generation)) = (self.reported, self.trial) {
            self.breaker.release_trial(generation);
        }
    }
}

impl fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("breaker", &self.breaker.name)
            .field("trial", &self.trial.is_some())
            .finish()
    }
}

/// Circuit breaker guarding one downstream operation
///
/// All state lives behind one mutex; every method is non-blocking.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use taskgate_engine::reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// let breaker = Arc::new(CircuitBreaker::new(
///     "inventory",
///     CircuitBreakerConfig::default().with_failure_threshold(1),
/// ));
///
/// let permit = breaker.acquire().unwrap();
/// permit.failure();
///
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(breaker.acquire().is_err());
/// ```
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreaker {
    /// Create a new closed circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                open_until: None,
                trial_in_flight: false,
                direct_trial: false,
                generation: 0,
            }),
            on_transition: None,
        }
    }

    /// Call `hook(from, to)` after every state change
    ///
    /// The hook runs outside the breaker lock.
    pub fn with_transition_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_transition = Some(Box::new(hook));
        self
    }

    /// Get the circuit breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the circuit breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    ///
    /// An open circuit whose reset timeout has passed still reports `Open`
    /// until the next `allow`/`acquire` call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Failures currently inside the sliding window
    pub fn failure_count(&self) -> usize {
        let mut state = self.state.lock();
        state.prune(Instant::now(), self.config.window_size);
        state.failures.len()
    }

    /// Check if a call should be allowed
    ///
    /// In half-open state only the caller that wins the trial slot gets
    /// `true`; it must report through [`record_success`](Self::record_success)
    /// or [`record_failure`](Self::record_failure).
    pub fn allow(&self) -> bool {
        self.admit(true).is_ok()
    }

    /// Check if a call should be allowed, returning a permit to report with
    pub fn acquire(self: &Arc<Self>) -> Result<CircuitPermit, CircuitBreakerError> {
        let trial = self.admit(false)?;
        Ok(CircuitPermit {
            breaker: Arc::clone(self),
            trial,
            reported: false,
        })
    }

    /// Record a successful call admitted by [`allow`](Self::allow)
    ///
    /// These calls carry no identity. While half-open, an outcome reported
    /// here decides the trial whenever the trial was admitted through
    /// `allow`, even if the reporting call was admitted before the circuit
    /// opened. Use [`acquire`](Self::acquire) when calls can outlive a state
    /// change; permit outcomes from outside the current trial are ignored.
    pub fn record_success(&self) {
        self.on_outcome(true, Reporter::Direct);
    }

    /// Record a failed call admitted by [`allow`](Self::allow)
    ///
    /// Same half-open attribution as [`record_success`](Self::record_success).
    pub fn record_failure(&self) {
        self.on_outcome(false, Reporter::Direct);
    }

    /// Record a call outcome from its result
    pub fn record_result<T, E>(&self, result: &Result<T, E>) {
        if result.is_ok() {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    /// Force the circuit closed and forget recorded failures
    pub fn reset(&self) {
        let change = {
            let mut state = self.state.lock();
            state.failures.clear();
            state.open_until = None;
            state.trial_in_flight = false;
            state.direct_trial = false;
            state.generation += 1;
            state.move_to(CircuitState::Closed)
        };
        self.notify(change);
    }

    /// Admit a call; `Ok(Some(generation))` means the caller is the
    /// half-open trial
    fn admit(&self, direct: bool) -> Result<Option<u64>, CircuitBreakerError> {
        let now = Instant::now();
        let (admitted, change) = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => (Ok(None), None),
                CircuitState::Open => {
                    let expired = state.open_until.map_or(true, |until| now >= until);
                    if expired {
                        state.generation += 1;
                        let generation = state.start_trial(direct);
                        (Ok(Some(generation)), state.move_to(CircuitState::HalfOpen))
                    } else {
                        (Err(CircuitBreakerError::Open), None)
                    }
                }
                CircuitState::HalfOpen => {
                    if state.trial_in_flight {
                        (Err(CircuitBreakerError::HalfOpenTrialInFlight), None)
                    } else {
                        (Ok(Some(state.start_trial(direct))), None)
                    }
                }
            }
        };

        self.notify(change);
        admitted
    }

    fn on_outcome(&self, success: bool, reporter: Reporter) {
        let now = Instant::now();
        let change = {
            let mut state = self.state.lock();
            let current = state.state;
            match current {
                CircuitState::Closed if success => {
                    state.failures.clear();
                    None
                }
                CircuitState::Closed => {
                    state.prune(now, self.config.window_size);
                    state.failures.push_back(now);
                    debug!(
                        breaker = %self.name,
                        failures = state.failures.len(),
                        threshold = self.config.failure_threshold,
                        "Recorded failure"
                    );
                    if state.failures.len() >= self.config.failure_threshold as usize {
                        state.open_until = Some(now + self.config.reset_timeout);
                        state.move_to(CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if state.owns_trial(reporter) => {
                    state.trial_in_flight = false;
                    state.direct_trial = false;
                    if success {
                        state.failures.clear();
                        state.open_until = None;
                        state.move_to(CircuitState::Closed)
                    } else {
                        state.open_until = Some(now + self.config.reset_timeout);
                        state.move_to(CircuitState::Open)
                    }
                }
                // Late outcomes, and trials from an earlier half-open period
                CircuitState::HalfOpen | CircuitState::Open => {
                    debug!(breaker = %self.name, state = %current, ?reporter, "Ignored outcome");
                    None
                }
            }
        };

        self.notify(change);
    }

    fn release_trial(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen
            && state.owns_trial(Reporter::Permit(Some(generation)))
        {
            state.trial_in_flight = false;
            debug!(breaker = %self.name, generation, "Trial permit released without outcome");
        }
    }

    fn notify(&self, change: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = change else {
            return;
        };

        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, %to, "Circuit opened"),
            _ => info!(breaker = %self.name, %from, %to, "Circuit state changed"),
        }

        if let Some(hook) = &self.on_transition {
            hook(from, to);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
