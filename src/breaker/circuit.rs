//! One backend's circuit breaker and the permits it hands out.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The call was rejected without being attempted.
    #[error("circuit open")]
    Open,

    /// The call ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

/// What a caller may do after asking for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Proceed,
    Trial,
    Reject,
}

/// Mutable breaker state. All transitions are plain functions of this
/// struct, the clock and the thresholds.
///
/// `generation` changes on every state transition. A permit only settles
/// against the generation it was admitted under, so a call admitted while
/// closed cannot decide the outcome of a later half-open trial.
#[derive(Debug, Clone, Copy)]
struct CircuitCore {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    generation: u64,
}

impl CircuitCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            trial_in_flight: false,
            generation: 0,
        }
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.generation = self.generation.wrapping_add(1);
    }

    fn admit(&mut self, now: Instant, recovery_timeout: Duration) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Proceed,
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .is_none_or(|t| now.saturating_duration_since(t) >= recovery_timeout);
                if cooled {
                    self.transition(CircuitState::HalfOpen);
                    self.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen if self.trial_in_flight => Admission::Reject,
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                Admission::Trial
            }
        }
    }

    /// Whether a permit admitted under `generation` may still settle.
    fn accepts(&self, generation: u64, trial: bool) -> bool {
        let expected = if trial {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        };
        self.generation == generation && self.state == expected
    }

    fn on_success(&mut self) {
        if self.state != CircuitState::Closed {
            self.transition(CircuitState::Closed);
        }
        self.failure_count = 0;
        self.trial_in_flight = false;
    }

    fn on_failure(&mut self, now: Instant, threshold: u32) {
        self.last_failure = Some(now);
        match self.state {
            CircuitState::HalfOpen => {
                self.transition(CircuitState::Open);
                self.trial_in_flight = false;
            }
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= threshold {
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Circuit breaker guarding one backend.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    core: Mutex<CircuitCore>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            core: Mutex::new(CircuitCore::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let core = self.core.lock();
        CircuitSnapshot {
            state: core.state,
            failure_count: core.failure_count,
        }
    }

    /// Run `f` under the breaker.
    ///
    /// Returns [`CircuitError::Open`] without invoking `f` when the breaker
    /// is open and cooling down, or while a half-open trial is in flight.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().ok_or(CircuitError::Open)?;
        match f().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(e) => {
                permit.fail();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Ask for permission to make one call.
    pub fn acquire(&self) -> Option<CallPermit<'_>> {
        self.acquire_at(Instant::now())
    }

    pub fn acquire_at(&self, now: Instant) -> Option<CallPermit<'_>> {
        let (admission, generation) = {
            let mut core = self.core.lock();
            let admission = core.admit(now, self.recovery_timeout);
            (admission, core.generation)
        };

        let trial = match admission {
            Admission::Reject => return None,
            Admission::Proceed => false,
            Admission::Trial => {
                info!(backend = %self.name, "circuit half open, sending trial request");
                true
            }
        };
        Some(CallPermit {
            breaker: self,
            trial,
            generation,
            settled: false,
        })
    }

    fn record_success(&self, generation: u64, trial: bool) {
        let mut core = self.core.lock();
        if !core.accepts(generation, trial) {
            debug!(backend = %self.name, "ignoring outcome of a call from an earlier circuit state");
            return;
        }
        let previous = core.state;
        core.on_success();
        if previous != CircuitState::Closed {
            info!(backend = %self.name, "circuit closed");
        }
    }

    fn record_failure_at(&self, now: Instant, generation: u64, trial: bool) {
        let mut core = self.core.lock();
        if !core.accepts(generation, trial) {
            debug!(backend = %self.name, "ignoring outcome of a call from an earlier circuit state");
            return;
        }
        let previous = core.state;
        core.on_failure(now, self.failure_threshold);
        if previous != CircuitState::Open && core.state == CircuitState::Open {
            warn!(
                backend = %self.name,
                failures = core.failure_count,
                recovery_timeout = ?self.recovery_timeout,
                "circuit opened"
            );
        }
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let mut core = self.core.lock();
        let generation = core.generation.wrapping_add(1);
        *core = CircuitCore {
            generation,
            ..CircuitCore::new()
        };
    }
}

/// Permission for one call. Settle it with [`succeed`](Self::succeed) or
/// [`fail`](Self::fail); a trial permit dropped unsettled counts as a failure.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.generation, self.trial);
    }

    pub fn fail(self) {
        self.fail_at(Instant::now());
    }

    pub fn fail_at(mut self, now: Instant) {
        self.settled = true;
        self.breaker.record_failure_at(now, self.generation, self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            warn!(backend = %self.breaker.name, "trial request cancelled");
            self.breaker
                .record_failure_at(Instant::now(), self.generation, self.trial);
        }
    }
}
