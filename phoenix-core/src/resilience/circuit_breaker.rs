//! Circuit breaker for brokerage calls
//!
//! Three-state breaker: Closed (normal) → Open (tripped) → HalfOpen (one
//! recovery trial). Failures are counted in a rolling window; a breaker is
//! Open exactly while `failures_in_window >= failure_threshold` has tripped it
//! and `recovery_timeout` has not yet elapsed.
//!
//! Every transition writes one `BREAKER_TRANSITION` audit record (under the
//! breaker's lock, so records are ordered) and then notifies the attached
//! [`SignalSink`] after the lock is released.

use crate::audit::{AuditLog, AuditRecordType};
use crate::core::clock::Clock;
use crate::governance::{GovernanceSignal, SignalSink};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit tripped, requests fail fast
    Open,
    /// One trial request admitted to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Gauge encoding, ordered by severity (0 closed, 1 half-open, 2 open)
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` that trip the breaker
    pub failure_threshold: u32,
    /// Rolling window for counting failures
    pub failure_window: Duration,
    /// How long to stay Open before admitting a trial request
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Aggressive configuration (for testing)
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 2,
            failure_window: Duration::from_secs(10),
            recovery_timeout: Duration::from_secs(5),
        }
    }
}

/// Read-only view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures_in_window: u32,
    pub failure_threshold: u32,
    pub trial_in_flight: bool,
    pub trips: u64,
}

#[derive(Serialize)]
struct BreakerTransitionRecord<'a> {
    breaker: &'a str,
    from: CircuitState,
    to: CircuitState,
    failures_in_window: u32,
    forced: bool,
    reason: &'a str,
}

struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    trips: u64,
}

type Transition = (CircuitState, CircuitState);

/// Circuit breaker protecting one component's calls
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    sink: RwLock<Option<Weak<dyn SignalSink>>>,
    inner: Mutex<BreakerInner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let name = name.into();
        debug!("Creating circuit breaker {} with config: {:?}", name, config);
        Self {
            name,
            config,
            clock,
            audit,
            sink: RwLock::new(None),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                trips: 0,
            }),
        }
    }

    /// Route transition notifications to `sink`
    pub fn attach_sink(&self, sink: Weak<dyn SignalSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call may proceed now
    ///
    /// In HalfOpen exactly one caller gets `true` until it reports back.
    pub fn allow_request(&self) -> bool {
        let (allowed, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner);
            let allowed = match inner.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        false
                    } else {
                        inner.trial_in_flight = true;
                        true
                    }
                }
            };
            (allowed, transition)
        };
        self.notify(transition);
        allowed
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.failures.clear();
                    inner.trial_in_flight = false;
                    inner.opened_at = None;
                    Some(self.transition(&mut inner, CircuitState::Closed, false, "trial succeeded"))
                }
                // Closed: in-window failures still count toward the threshold
                CircuitState::Closed | CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            match inner.state {
                CircuitState::Closed => {
                    self.prune(&mut inner, now);
                    inner.failures.push_back(now);
                    if inner.failures.len() as u32 >= self.config.failure_threshold {
                        inner.opened_at = Some(now);
                        inner.trips += 1;
                        Some(self.transition(&mut inner, CircuitState::Open, false, "failure threshold reached"))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    inner.trial_in_flight = false;
                    inner.opened_at = Some(now);
                    inner.trips += 1;
                    Some(self.transition(&mut inner, CircuitState::Open, false, "trial failed"))
                }
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Operator override: trip immediately
    pub fn force_open(&self, reason: &str) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Open {
                None
            } else {
                inner.opened_at = Some(self.clock.now());
                inner.trial_in_flight = false;
                inner.trips += 1;
                Some(self.transition(&mut inner, CircuitState::Open, true, reason))
            }
        };
        self.notify(transition);
    }

    /// Operator override: close and clear counters
    pub fn force_close(&self, reason: &str) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Closed {
                inner.failures.clear();
                None
            } else {
                inner.failures.clear();
                inner.opened_at = None;
                inner.trial_in_flight = false;
                Some(self.transition(&mut inner, CircuitState::Closed, true, reason))
            }
        };
        self.notify(transition);
    }

    /// Current state, applying the lazy Open → HalfOpen check
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner);
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    /// Failures currently inside the rolling window
    pub fn failure_count(&self) -> u32 {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        self.prune(&mut inner, now);
        inner.failures.len() as u32
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        self.prune(&mut inner, now);
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            failures_in_window: inner.failures.len() as u32,
            failure_threshold: self.config.failure_threshold,
            trial_in_flight: inner.trial_in_flight,
            trips: inner.trips,
        }
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(&oldest) = inner.failures.front() {
            if now.saturating_duration_since(oldest) >= self.config.failure_window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn refresh(&self, inner: &mut BreakerInner) -> Option<Transition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        if self.clock.now().saturating_duration_since(opened_at) < self.config.recovery_timeout {
            return None;
        }
        inner.trial_in_flight = false;
        Some(self.transition(inner, CircuitState::HalfOpen, false, "recovery timeout elapsed"))
    }

    fn transition(
        &self,
        inner: &mut BreakerInner,
        to: CircuitState,
        forced: bool,
        reason: &str,
    ) -> Transition {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitState::Open => warn!(
                "Circuit breaker {} TRIPPED: {} -> OPEN ({})",
                self.name, from, reason
            ),
            CircuitState::HalfOpen => debug!(
                "Circuit breaker {} transitioning to HALF_OPEN (testing recovery)",
                self.name
            ),
            CircuitState::Closed => info!(
                "Circuit breaker {} transitioning to CLOSED ({})",
                self.name, reason
            ),
        }

        self.audit.record(
            AuditRecordType::BreakerTransition,
            &self.name,
            &BreakerTransitionRecord {
                breaker: &self.name,
                from,
                to,
                failures_in_window: inner.failures.len() as u32,
                forced,
                reason,
            },
        );
        (from, to)
    }

    fn notify(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        let sink = self.sink.read().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            sink.on_signal(GovernanceSignal::BreakerChanged {
                breaker: self.name.clone(),
                from,
                to,
            });
        }
    }
}
