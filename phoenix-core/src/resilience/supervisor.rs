//! Broker liveness supervisor
//!
//! The supervisor runs on its own named thread and never shares a run loop
//! with the brokerage connector. Every connector call it makes goes through
//! [`contain`], so a crashing connector shows up here as a missed heartbeat
//! rather than unwinding the watcher.
//!
//! Heartbeat model:
//! - checks are scheduled at `interval ± jitter`; a beat is only overdue once
//!   its scheduled check has run and failed
//! - from then on `missed = max(1, floor(time_since_last_seen / interval))`
//! - `Suspect(missed)` for `1 <= missed < missed_before_dead`, `Dead` after
//! - a `Disconnected` check answer or a call-site disconnect report is DEAD
//!   immediately
//!
//! On DEAD the supervisor reconnects through [`Backoff`]. A reconnection only
//! counts once `get_account()` reports the expected account id. After
//! `max_attempts` failures it stops and waits for [`Supervisor::operator_retry`].
//! A cascade halt parks reconnection until the operator retries.
//!
//! The supervisor also watches itself from the outside: every
//! `liveness_interval` it writes a `SUPERVISOR_LIVENESS` record and refreshes
//! the [`SupervisorBeacon`], whose age an external watchdog can check.

use super::backoff::{Backoff, BackoffPolicy};
use super::halt::HaltPropagator;
use super::panic::contain;
use crate::audit::{AuditLog, AuditRecordType};
use crate::broker::Brokerage;
use crate::core::clock::{CancelToken, Clock};
use crate::core::errors::{BrokerError, ErrorClass};
use crate::governance::{GovernanceSignal, SignalSink};
use crate::monitoring::alerts::{Alert, AlertClass, AlertDispatcher};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Liveness of the watched connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatStatus {
    Alive,
    Suspect { missed: u32 },
    Dead,
}

impl HeartbeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatStatus::Alive => "ALIVE",
            HeartbeatStatus::Suspect { .. } => "SUSPECT",
            HeartbeatStatus::Dead => "DEAD",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Check cadence is `interval ± jitter`
    pub jitter: Duration,
    pub missed_before_dead: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            jitter: Duration::from_secs(5),
            missed_before_dead: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub heartbeat: HeartbeatConfig,
    /// Reconnection policy; `max_attempts` caps automatic retries
    pub backoff: BackoffPolicy,
    /// Identity a reconnection must report before it is trusted
    pub expected_account_id: String,
    pub liveness_interval: Duration,
    /// Beacon age beyond which the supervisor counts as silent
    pub liveness_silence_bound: Duration,
    pub beacon_path: Option<PathBuf>,
    /// Run loop granularity
    pub tick: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            backoff: BackoffPolicy::default(),
            expected_account_id: String::new(),
            liveness_interval: Duration::from_secs(10),
            liveness_silence_bound: Duration::from_secs(30),
            beacon_path: None,
            tick: Duration::from_millis(100),
        }
    }
}

/// Heartbeat bookkeeping for the watched component
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub component_id: String,
    pub interval: Duration,
    pub jitter: Duration,
    pub last_seen_at: Instant,
    pub missed_count: u32,
}

/// Where reconnection stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Waiting { attempt: u32, retry_at: Instant },
    /// `max_attempts` failed; operator retry required
    Exhausted { attempts: u32 },
    /// Parked by a cascade halt
    AwaitingOperator,
}

impl ReconnectPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectPhase::Idle => "IDLE",
            ReconnectPhase::Waiting { .. } => "WAITING",
            ReconnectPhase::Exhausted { .. } => "EXHAUSTED",
            ReconnectPhase::AwaitingOperator => "AWAITING_OPERATOR",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("operator retry requires a named operator")]
    MissingActor,

    #[error("reconnection is {0}, nothing to retry")]
    NothingToRetry(&'static str),
}

/// Read-only view of the supervisor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorStatus {
    pub component_id: String,
    pub heartbeat: HeartbeatStatus,
    pub missed_count: u32,
    pub last_seen_age_ms: u64,
    pub reconnect_phase: &'static str,
    pub reconnect_attempt: u32,
    pub checks: u64,
    pub check_failures: u64,
    pub reconnects_validated: u64,
    pub liveness_age_ms: Option<u64>,
}

// ============================================================================
// Beacon
// ============================================================================

/// Independent timestamp refreshed by the supervisor
///
/// Lives in memory (for the in-process status surface) and optionally in a
/// file (for the external watchdog process).
#[derive(Debug)]
pub struct SupervisorBeacon {
    last_ms: AtomicU64,
    path: Option<PathBuf>,
}

impl SupervisorBeacon {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            last_ms: AtomicU64::new(0),
            path,
        }
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_ms.store(now_ms, Ordering::Release);
        if let Some(path) = &self.path {
            if let Err(e) = fs::write(path, now_ms.to_string()) {
                warn!("Failed to write supervisor beacon {}: {}", path.display(), e);
            }
        }
    }

    pub fn last_ms(&self) -> Option<u64> {
        match self.last_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Time since the last touch; None before the first one
    pub fn silence(&self, now_ms: u64) -> Option<Duration> {
        self.last_ms()
            .map(|last| Duration::from_millis(now_ms.saturating_sub(last)))
    }

    /// Silent for longer than `bound` (never touched counts as silent)
    pub fn is_silent(&self, now_ms: u64, bound: Duration) -> bool {
        self.silence(now_ms).map_or(true, |s| s > bound)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read a beacon file written by another process
    pub fn read_file(path: impl AsRef<Path>) -> io::Result<u64> {
        let text = fs::read_to_string(path)?;
        text.trim()
            .parse::<u64>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Lock-free heartbeat push from the connector side
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    seq: Arc<AtomicU64>,
}

impl HeartbeatHandle {
    #[inline]
    pub fn beat(&self) {
        self.seq.fetch_add(1, Ordering::Release);
    }
}

// ============================================================================
// Supervisor
// ============================================================================

#[derive(Serialize)]
struct HeartbeatRecord<'a> {
    component: &'a str,
    from: HeartbeatStatus,
    to: HeartbeatStatus,
    missed_count: u32,
    reason: &'a str,
}

#[derive(Serialize)]
struct ReconnectRecord<'a> {
    attempt: u32,
    max_attempts: u32,
    detail: &'a str,
}

#[derive(Serialize)]
struct LivenessRecord<'a> {
    heartbeat: HeartbeatStatus,
    reconnect_phase: &'a str,
    checks: u64,
    check_failures: u64,
}

struct SupervisorState {
    heartbeat: Heartbeat,
    status: HeartbeatStatus,
    forced_dead: bool,
    /// The check due since the last sighting ran and failed
    beat_overdue: bool,
    phase: ReconnectPhase,
    backoff: Backoff,
    next_check_at: Instant,
    next_liveness_at: Instant,
    last_beat_seq: u64,
    checks: u64,
    check_failures: u64,
    reconnects_validated: u64,
}

/// Watches the brokerage connection from its own failure domain
pub struct Supervisor {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    alerts: Arc<AlertDispatcher>,
    sink: Arc<dyn SignalSink>,
    broker: Arc<dyn Brokerage>,
    halt: Arc<HaltPropagator>,
    beacon: Arc<SupervisorBeacon>,
    beats: Arc<AtomicU64>,
    disconnect_reported: AtomicBool,
    disconnect_reason: Mutex<Option<String>>,
    state: Mutex<SupervisorState>,
    published: RwLock<SupervisorStatus>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("status", &*self.published.read())
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        alerts: Arc<AlertDispatcher>,
        sink: Arc<dyn SignalSink>,
        broker: Arc<dyn Brokerage>,
        halt: Arc<HaltPropagator>,
    ) -> Self {
        let now = clock.now();
        let heartbeat = Heartbeat {
            component_id: format!("broker.{}", broker.name()),
            interval: config.heartbeat.interval,
            jitter: config.heartbeat.jitter,
            last_seen_at: now,
            missed_count: 0,
        };
        let published = SupervisorStatus {
            component_id: heartbeat.component_id.clone(),
            heartbeat: HeartbeatStatus::Alive,
            missed_count: 0,
            last_seen_age_ms: 0,
            reconnect_phase: ReconnectPhase::Idle.as_str(),
            reconnect_attempt: 0,
            checks: 0,
            check_failures: 0,
            reconnects_validated: 0,
            liveness_age_ms: None,
        };
        let next_check_at = now + jittered(&config.heartbeat);
        Self {
            beacon: Arc::new(SupervisorBeacon::new(config.beacon_path.clone())),
            state: Mutex::new(SupervisorState {
                heartbeat,
                status: HeartbeatStatus::Alive,
                forced_dead: false,
                beat_overdue: false,
                phase: ReconnectPhase::Idle,
                backoff: Backoff::new(config.backoff.clone()),
                next_check_at,
                next_liveness_at: now,
                last_beat_seq: 0,
                checks: 0,
                check_failures: 0,
                reconnects_validated: 0,
            }),
            published: RwLock::new(published),
            config,
            clock,
            audit,
            alerts,
            sink,
            broker,
            halt,
            beats: Arc::new(AtomicU64::new(0)),
            disconnect_reported: AtomicBool::new(false),
            disconnect_reason: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn heartbeat_handle(&self) -> HeartbeatHandle {
        HeartbeatHandle {
            seq: self.beats.clone(),
        }
    }

    pub fn beacon(&self) -> Arc<SupervisorBeacon> {
        self.beacon.clone()
    }

    /// A call site saw the connection drop; DEAD on the next tick
    pub fn report_disconnect(&self, reason: &str) {
        *self.disconnect_reason.lock() = Some(reason.to_string());
        self.disconnect_reported.store(true, Ordering::Release);
    }

    pub fn status(&self) -> SupervisorStatus {
        let mut status = self.published.read().clone();
        status.liveness_age_ms = self
            .beacon
            .silence(self.clock.wall_millis())
            .map(|d| d.as_millis() as u64);
        status
    }

    pub fn heartbeat_status(&self) -> HeartbeatStatus {
        self.published.read().heartbeat
    }

    pub fn reconnect_phase(&self) -> ReconnectPhase {
        self.state.lock().phase
    }

    /// Restart reconnection after exhaustion or a halt park
    pub fn operator_retry(&self, actor: &str) -> Result<(), SupervisorError> {
        if actor.trim().is_empty() {
            return Err(SupervisorError::MissingActor);
        }
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.phase {
            ReconnectPhase::Exhausted { .. } | ReconnectPhase::AwaitingOperator => {
                info!("Operator {} restarted reconnection", actor);
                state.backoff.reset();
                self.schedule_retry(&mut state, now);
                self.publish(&state, now);
                Ok(())
            }
            phase => Err(SupervisorError::NothingToRetry(phase.as_str())),
        }
    }

    /// One pass of the supervision loop
    pub fn tick(&self) {
        let mut signals = Vec::new();
        {
            let mut state = self.state.lock();
            self.tick_locked(&mut state, &mut signals);
        }
        for signal in signals {
            self.sink.on_signal(signal);
        }
    }

    fn tick_locked(&self, state: &mut SupervisorState, signals: &mut Vec<GovernanceSignal>) {
        let now = self.clock.now();

        // pushed beats count only while the connection is believed up
        let seq = self.beats.load(Ordering::Acquire);
        if seq != state.last_beat_seq {
            state.last_beat_seq = seq;
            if state.status != HeartbeatStatus::Dead {
                state.heartbeat.last_seen_at = now;
                state.beat_overdue = false;
            }
        }

        let mut reason = String::from("heartbeats missed");
        if self.disconnect_reported.swap(false, Ordering::AcqRel) {
            reason = self
                .disconnect_reason
                .lock()
                .take()
                .unwrap_or_else(|| "disconnect reported".to_string());
            if state.status != HeartbeatStatus::Dead {
                state.forced_dead = true;
            }
        }

        let mut check_passed = false;
        if state.status != HeartbeatStatus::Dead && now >= state.next_check_at {
            state.next_check_at = now + jittered(&self.config.heartbeat);
            state.checks += 1;
            match contain(|| self.broker.get_account()) {
                Ok(Ok(_)) => {
                    state.heartbeat.last_seen_at = now;
                    state.beat_overdue = false;
                    check_passed = true;
                }
                Ok(Err(BrokerError::Disconnected)) => {
                    state.check_failures += 1;
                    state.beat_overdue = true;
                    state.forced_dead = true;
                    reason = "check: broker disconnected".to_string();
                }
                Ok(Err(e)) => {
                    state.check_failures += 1;
                    state.beat_overdue = true;
                    debug!("Heartbeat check failed: {}", e);
                }
                Err(panic) => {
                    state.check_failures += 1;
                    state.beat_overdue = true;
                    warn!("Heartbeat check panicked in connector: {}", panic);
                }
            }
        }

        if state.status != HeartbeatStatus::Dead {
            state.heartbeat.missed_count = if state.beat_overdue {
                let elapsed = now.saturating_duration_since(state.heartbeat.last_seen_at);
                let interval_ms = state.heartbeat.interval.as_millis().max(1);
                ((elapsed.as_millis() / interval_ms) as u32).max(1)
            } else {
                0
            };
            let next = if state.forced_dead
                || state.heartbeat.missed_count >= self.config.heartbeat.missed_before_dead
            {
                HeartbeatStatus::Dead
            } else if state.heartbeat.missed_count >= 1 {
                HeartbeatStatus::Suspect {
                    missed: state.heartbeat.missed_count,
                }
            } else {
                HeartbeatStatus::Alive
            };
            if next != state.status {
                self.set_status(state, next, &reason, signals);
                if next == HeartbeatStatus::Dead {
                    self.on_dead(state, now, &reason, signals);
                }
            }
        }
        // after the status update, so recovery sees the connection alive
        if check_passed {
            signals.push(GovernanceSignal::HealthCheckPassed);
        }

        self.drive_reconnect(state, now, signals);

        if now >= state.next_liveness_at {
            state.next_liveness_at = now + self.config.liveness_interval;
            self.audit.record(
                AuditRecordType::SupervisorLiveness,
                "supervisor",
                &LivenessRecord {
                    heartbeat: state.status,
                    reconnect_phase: state.phase.as_str(),
                    checks: state.checks,
                    check_failures: state.check_failures,
                },
            );
            self.beacon.touch(self.clock.wall_millis());
        }

        self.publish(state, now);
    }

    fn set_status(
        &self,
        state: &mut SupervisorState,
        to: HeartbeatStatus,
        reason: &str,
        signals: &mut Vec<GovernanceSignal>,
    ) {
        let from = state.status;
        state.status = to;
        match to {
            HeartbeatStatus::Dead => error!("Broker heartbeat DEAD: {}", reason),
            HeartbeatStatus::Suspect { missed } => warn!("Broker heartbeat SUSPECT ({} missed)", missed),
            HeartbeatStatus::Alive => info!("Broker heartbeat ALIVE"),
        }
        self.audit.record(
            AuditRecordType::HeartbeatStatus,
            "supervisor",
            &HeartbeatRecord {
                component: &state.heartbeat.component_id,
                from,
                to,
                missed_count: state.heartbeat.missed_count,
                reason,
            },
        );
        signals.push(GovernanceSignal::Heartbeat(to));
    }

    fn on_dead(
        &self,
        state: &mut SupervisorState,
        now: Instant,
        reason: &str,
        signals: &mut Vec<GovernanceSignal>,
    ) {
        state.forced_dead = false;
        signals.push(GovernanceSignal::ConnectionLost {
            reason: reason.to_string(),
        });
        self.alerts.dispatch(
            Alert::critical(AlertClass::HeartbeatDead, format!("broker connection DEAD: {reason}"))
                .with_detail("component", &state.heartbeat.component_id)
                .with_detail("missed", state.heartbeat.missed_count),
        );
        state.backoff.reset();
        if self.halt.is_cascade_engaged() {
            self.park(state);
        } else {
            self.schedule_retry(state, now);
        }
    }

    fn schedule_retry(&self, state: &mut SupervisorState, now: Instant) {
        match state.backoff.next_delay() {
            Some(delay) => {
                let attempt = state.backoff.attempt_count();
                info!(
                    "Reconnect attempt {}/{} in {:?}",
                    attempt,
                    state.backoff.policy().max_attempts,
                    delay
                );
                state.phase = ReconnectPhase::Waiting {
                    attempt,
                    retry_at: now + delay,
                };
            }
            None => {
                let attempts = state.backoff.attempt_count();
                error!("Reconnection exhausted after {} attempts; operator required", attempts);
                state.phase = ReconnectPhase::Exhausted { attempts };
                self.audit.record(
                    AuditRecordType::ReconnectExhausted,
                    "supervisor",
                    &ReconnectRecord {
                        attempt: attempts,
                        max_attempts: state.backoff.policy().max_attempts,
                        detail: "automatic retries stopped",
                    },
                );
                self.alerts.dispatch(
                    Alert::critical(
                        AlertClass::ReconnectExhausted,
                        format!("reconnection exhausted after {attempts} attempts"),
                    )
                    .with_detail("component", &state.heartbeat.component_id),
                );
            }
        }
    }

    fn park(&self, state: &mut SupervisorState) {
        warn!("Reconnection parked by cascade halt");
        state.phase = ReconnectPhase::AwaitingOperator;
        self.audit.record(
            AuditRecordType::ReconnectParked,
            "supervisor",
            &ReconnectRecord {
                attempt: state.backoff.attempt_count(),
                max_attempts: state.backoff.policy().max_attempts,
                detail: "cascade halt engaged",
            },
        );
    }

    fn drive_reconnect(
        &self,
        state: &mut SupervisorState,
        now: Instant,
        signals: &mut Vec<GovernanceSignal>,
    ) {
        let ReconnectPhase::Waiting { attempt, retry_at } = state.phase else {
            return;
        };
        if self.halt.is_cascade_engaged() {
            self.park(state);
            return;
        }
        if now < retry_at {
            return;
        }

        let max_attempts = state.backoff.policy().max_attempts;
        self.audit.record(
            AuditRecordType::ReconnectAttempt,
            "supervisor",
            &ReconnectRecord {
                attempt,
                max_attempts,
                detail: "connect",
            },
        );

        let expected = &self.config.expected_account_id;
        let outcome = contain(|| {
            self.broker.connect()?;
            self.broker.get_account()
        });
        let failure = match outcome {
            Ok(Ok(account)) if expected.is_empty() || &account.account_id == expected => {
                info!(
                    "Reconnection validated: account {} session {}",
                    account.account_id, account.session_id
                );
                state.backoff.reset();
                state.phase = ReconnectPhase::Idle;
                state.reconnects_validated += 1;
                state.heartbeat.last_seen_at = now;
                state.heartbeat.missed_count = 0;
                state.beat_overdue = false;
                state.next_check_at = now + jittered(&self.config.heartbeat);
                self.audit.record(
                    AuditRecordType::ReconnectValidated,
                    "supervisor",
                    &serde_json::json!({
                        "attempt": attempt,
                        "account_id": account.account_id,
                        "session_id": account.session_id,
                    }),
                );
                self.set_status(state, HeartbeatStatus::Alive, "reconnection validated", signals);
                signals.push(GovernanceSignal::ConnectionValidated {
                    account_id: account.account_id,
                    session_id: account.session_id,
                });
                return;
            }
            Ok(Ok(account)) => format!(
                "identity mismatch: expected {}, broker reports {}",
                expected, account.account_id
            ),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("connector panicked: {panic}"),
        };

        warn!("Reconnect attempt {}/{} failed: {}", attempt, max_attempts, failure);
        let _ = contain(|| self.broker.disconnect());
        signals.push(GovernanceSignal::Failure {
            source: "supervisor.reconnect".to_string(),
            class: ErrorClass::Transient,
            detail: failure,
        });
        self.schedule_retry(state, now);
    }

    fn publish(&self, state: &SupervisorState, now: Instant) {
        let attempt = match state.phase {
            ReconnectPhase::Waiting { attempt, .. } => attempt,
            ReconnectPhase::Exhausted { attempts } => attempts,
            _ => 0,
        };
        let mut published = self.published.write();
        published.heartbeat = state.status;
        published.missed_count = state.heartbeat.missed_count;
        published.last_seen_age_ms =
            now.saturating_duration_since(state.heartbeat.last_seen_at).as_millis() as u64;
        published.reconnect_phase = state.phase.as_str();
        published.reconnect_attempt = attempt;
        published.checks = state.checks;
        published.check_failures = state.check_failures;
        published.reconnects_validated = state.reconnects_validated;
    }

    /// Run the supervision loop on a dedicated thread
    pub fn spawn(self: Arc<Self>) -> io::Result<SupervisorHandle> {
        let stop = CancelToken::new();
        let thread_stop = stop.clone();
        let supervisor = self.clone();
        let thread = thread::Builder::new()
            .name("phoenix-supervisor".to_string())
            .spawn(move || {
                info!("Supervisor started");
                while !thread_stop.is_cancelled() {
                    if let Err(panic) = contain(|| supervisor.tick()) {
                        error!("Supervisor tick panicked: {}", panic);
                    }
                    supervisor.clock.sleep(supervisor.config.tick, &thread_stop);
                }
                info!("Supervisor stopped");
            })?;
        Ok(SupervisorHandle {
            supervisor: self,
            stop,
            thread: Some(thread),
        })
    }
}

fn jittered(config: &HeartbeatConfig) -> Duration {
    let jitter_ms = config.jitter.as_millis() as i64;
    let base_ms = config.interval.as_millis() as i64;
    let offset = if jitter_ms > 0 {
        rand::thread_rng().gen_range(-jitter_ms..=jitter_ms)
    } else {
        0
    };
    Duration::from_millis((base_ms + offset).max(1) as u64)
}

/// Owner handle for a running supervisor thread
pub struct SupervisorHandle {
    supervisor: Arc<Supervisor>,
    stop: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn report_disconnect(&self, reason: &str) {
        self.supervisor.report_disconnect(reason);
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn join(mut self) {
        self.stop.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Supervisor thread terminated by panic");
            }
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::broker::{FaultProfile, SimulatedBroker};
    use crate::core::clock::ManualClock;
    use crate::governance::NullSink;
    use crate::monitoring::alerts::{AlertConfig, RecordingSink};
    use crate::resilience::halt::{HaltConfig, HaltMode};

    struct Fixture {
        clock: Arc<ManualClock>,
        audit: Arc<AuditLog>,
        broker: Arc<SimulatedBroker>,
        halt: Arc<HaltPropagator>,
        alerts: Arc<RecordingSink>,
        supervisor: Supervisor,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::shared();
        let audit = Arc::new(AuditLog::in_memory(clock.clone()));
        let broker = Arc::new(SimulatedBroker::new("ACC-1", FaultProfile::perfect(), clock.clone()));
        broker.connect().unwrap();
        let halt = Arc::new(HaltPropagator::new(HaltConfig::default(), clock.clone(), audit.clone()));
        let recording = Arc::new(RecordingSink::new());
        let alerts = Arc::new(AlertDispatcher::new(
            AlertConfig::default(),
            clock.clone(),
            vec![recording.clone()],
        ));
        let config = SupervisorConfig {
            heartbeat: HeartbeatConfig {
                jitter: Duration::ZERO,
                ..Default::default()
            },
            backoff: BackoffPolicy {
                jitter_fraction: 0.0,
                max_attempts: 3,
                ..Default::default()
            },
            expected_account_id: "ACC-1".to_string(),
            ..Default::default()
        };
        let supervisor = Supervisor::new(
            config,
            clock.clone(),
            audit.clone(),
            alerts,
            Arc::new(NullSink),
            broker.clone(),
            halt.clone(),
        );
        Fixture {
            clock,
            audit,
            broker,
            halt,
            alerts: recording,
            supervisor,
        }
    }

    #[test]
    fn test_healthy_broker_stays_alive() {
        let f = fixture();
        for _ in 0..10 {
            f.clock.advance(Duration::from_secs(30));
            f.supervisor.tick();
        }
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Alive);
        assert_eq!(f.supervisor.status().checks, 10);
    }

    #[test]
    fn test_late_jittered_check_is_not_a_miss() {
        let f = fixture();
        {
            let mut state = f.supervisor.state.lock();
            state.next_check_at = f.clock.now() + Duration::from_secs(35);
        }
        f.clock.advance(Duration::from_millis(34_900));
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Alive);
        assert_eq!(f.supervisor.status().missed_count, 0);

        f.clock.advance(Duration::from_millis(100));
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Alive);
        assert_eq!(f.supervisor.status().checks, 1);
    }

    #[test]
    fn test_failed_early_check_counts_one_miss() {
        let f = fixture();
        {
            let mut state = f.supervisor.state.lock();
            state.next_check_at = f.clock.now() + Duration::from_secs(25);
        }
        f.broker.panic_on_call(true);
        f.clock.advance(Duration::from_secs(25));
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Suspect { missed: 1 });
    }

    #[test]
    fn test_panicking_connector_is_dead_at_three_intervals() {
        let f = fixture();
        f.broker.panic_on_call(true);
        f.clock.advance(Duration::from_secs(30));
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Suspect { missed: 1 });
        f.clock.advance(Duration::from_secs(30));
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Suspect { missed: 2 });
        f.clock.advance(Duration::from_secs(30));
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Dead);
        assert_eq!(f.alerts.count(AlertClass::HeartbeatDead), 1);

        // first reconnect waits exactly the base interval
        match f.supervisor.reconnect_phase() {
            ReconnectPhase::Waiting { attempt, retry_at } => {
                assert_eq!(attempt, 1);
                assert_eq!(retry_at - f.clock.now(), Duration::from_secs(1));
            }
            other => panic!("unexpected phase {other:?}"),
        }
    }

    #[test]
    fn test_crashed_broker_is_dead_on_next_check() {
        let f = fixture();
        f.broker.crash();
        f.clock.advance(Duration::from_secs(30));
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Dead);
    }

    #[test]
    fn test_reconnect_validates_identity() {
        let f = fixture();
        f.supervisor.report_disconnect("submit failed");
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Dead);

        f.broker.set_account_id("SOMEONE-ELSE");
        f.clock.advance(Duration::from_secs(1));
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Dead);
        assert!(matches!(
            f.supervisor.reconnect_phase(),
            ReconnectPhase::Waiting { attempt: 2, .. }
        ));

        f.broker.set_account_id("ACC-1");
        f.clock.advance(Duration::from_secs(2));
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Alive);
        assert_eq!(f.supervisor.reconnect_phase(), ReconnectPhase::Idle);
        assert_eq!(
            f.audit.count(&AuditQuery::of_type(AuditRecordType::ReconnectValidated)),
            1
        );
    }

    #[test]
    fn test_exhaustion_requires_operator() {
        let f = fixture();
        f.broker.crash();
        f.supervisor.report_disconnect("gone");
        f.supervisor.tick();
        for _ in 0..10 {
            f.clock.advance(Duration::from_secs(60));
            f.supervisor.tick();
        }
        assert_eq!(
            f.supervisor.reconnect_phase(),
            ReconnectPhase::Exhausted { attempts: 3 }
        );
        assert_eq!(
            f.audit.count(&AuditQuery::of_type(AuditRecordType::ReconnectAttempt)),
            3
        );
        assert_eq!(f.alerts.count(AlertClass::ReconnectExhausted), 1);

        assert_eq!(f.supervisor.operator_retry(""), Err(SupervisorError::MissingActor));
        f.broker.restore();
        f.supervisor.operator_retry("ops").unwrap();
        f.clock.advance(Duration::from_secs(1));
        f.supervisor.tick();
        assert_eq!(f.supervisor.heartbeat_status(), HeartbeatStatus::Alive);
    }

    #[test]
    fn test_cascade_halt_parks_reconnection() {
        let f = fixture();
        f.supervisor.report_disconnect("gone");
        f.supervisor.tick();
        f.halt.halt_cascade(HaltMode::ExitOnly, "operator");
        f.supervisor.tick();
        assert_eq!(f.supervisor.reconnect_phase(), ReconnectPhase::AwaitingOperator);

        f.clock.advance(Duration::from_secs(600));
        f.supervisor.tick();
        assert_eq!(
            f.audit.count(&AuditQuery::of_type(AuditRecordType::ReconnectAttempt)),
            0
        );
    }

    #[test]
    fn test_liveness_records_and_beacon() {
        let f = fixture();
        f.supervisor.tick();
        f.clock.advance(Duration::from_secs(10));
        f.supervisor.tick();
        assert_eq!(
            f.audit.count(&AuditQuery::of_type(AuditRecordType::SupervisorLiveness)),
            2
        );
        let beacon = f.supervisor.beacon();
        let now_ms = f.clock.wall_millis();
        assert_eq!(beacon.silence(now_ms), Some(Duration::ZERO));
        assert!(beacon.is_silent(now_ms + 31_000, Duration::from_secs(30)));
    }

    #[test]
    fn test_beacon_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.beacon");
        let beacon = SupervisorBeacon::new(Some(path.clone()));
        beacon.touch(1_700_000_000_123);
        assert_eq!(SupervisorBeacon::read_file(&path).unwrap(), 1_700_000_000_123);
    }
}
