//! Governance coordinator
//!
//! Single owner of the breaker registry, the health machine and the derived
//! tier. Every signal (breaker transition, heartbeat change, connection
//! loss/validation, classified failure, passed health check) lands in
//! [`GovernanceCoordinator::on_signal`], which updates health and re-derives
//! the tier under one lock.
//!
//! Lock order: coordinator state → halt propagator → audit log. Breaker
//! snapshots are taken before the state lock because reading a breaker can
//! itself emit a transition signal back into the coordinator.

use super::degradation::{derive_tier, ConnectionView, DegradationConfig, DegradationTier, TierInputs};
use super::health::{ContributingSignals, HealthConfig, HealthError, HealthLevel, HealthMachine, HealthSnapshot};
use super::{GovernanceSignal, SignalSink};
use crate::audit::{AuditLog, AuditRecordType};
use crate::core::clock::Clock;
use crate::core::errors::ErrorClass;
use crate::monitoring::alerts::{Alert, AlertClass, AlertDispatcher, AlertSeverity};
use crate::resilience::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::resilience::halt::{HaltError, HaltMode, HaltPropagator, HaltReceipt, HaltStatus};
use crate::resilience::supervisor::HeartbeatStatus;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

/// Connection section of a governance snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub validated: bool,
    pub disconnected_for_ms: Option<u64>,
    pub account_id: Option<String>,
    pub session_id: Option<u64>,
}

/// Immutable view handed to consumers
#[derive(Debug, Clone, Serialize)]
pub struct GovernanceSnapshot {
    pub tier: DegradationTier,
    pub tier_reason: String,
    pub health: HealthSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
    pub heartbeat: HeartbeatStatus,
    pub connection: ConnectionSnapshot,
    pub halt: HaltStatus,
    /// Human-readable reason of the most recent health or tier transition
    pub last_transition_reason: String,
    pub taken_at_ms: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OperatorError {
    #[error(transparent)]
    Halt(#[from] HaltError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error("nothing to release: no halt engaged and health is not HALTED")]
    NothingToRelease,
}

#[derive(Serialize)]
struct TierChangeRecord<'a> {
    from: DegradationTier,
    to: DegradationTier,
    reason: &'a str,
    health: HealthLevel,
    connection_validated: bool,
}

struct CoordinatorState {
    health: HealthMachine,
    connection: ConnectionView,
    session: Option<(String, u64)>,
    heartbeat: HeartbeatStatus,
    tier: DegradationTier,
    tier_reason: String,
    last_transition_reason: String,
    degradation: DegradationConfig,
}

/// Owner of breakers, health and tier
pub struct GovernanceCoordinator {
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    alerts: Arc<AlertDispatcher>,
    halt: Arc<HaltPropagator>,
    breakers: RwLock<Vec<Arc<CircuitBreaker>>>,
    state: Mutex<CoordinatorState>,
    me: Weak<GovernanceCoordinator>,
}

impl fmt::Debug for GovernanceCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("GovernanceCoordinator")
            .field("tier", &state.tier)
            .field("health", &state.health.level())
            .finish()
    }
}

impl GovernanceCoordinator {
    /// Starts at T1: the connection is unvalidated until the first
    /// `ConnectionValidated` signal.
    pub fn new(
        health: HealthConfig,
        degradation: DegradationConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        alerts: Arc<AlertDispatcher>,
        halt: Arc<HaltPropagator>,
    ) -> Arc<Self> {
        let now = clock.now();
        let now_ms = clock.wall_millis();
        let health = HealthMachine::new(health, audit.clone(), alerts.clone(), now, now_ms);
        Arc::new_cyclic(|me| Self {
            clock,
            audit,
            alerts,
            halt,
            breakers: RwLock::new(Vec::new()),
            state: Mutex::new(CoordinatorState {
                health,
                connection: ConnectionView::Unvalidated { since: now },
                session: None,
                heartbeat: HeartbeatStatus::Alive,
                tier: DegradationTier::T1,
                tier_reason: "connection not yet validated".to_string(),
                last_transition_reason: "startup".to_string(),
                degradation,
            }),
            me: me.clone(),
        })
    }

    /// Create a breaker whose transitions feed this coordinator
    pub fn register_breaker(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breaker(name) {
            return existing;
        }
        let breaker = Arc::new(CircuitBreaker::new(
            name,
            config,
            self.clock.clone(),
            self.audit.clone(),
        ));
        let sink: Weak<dyn SignalSink> = self.me.clone();
        breaker.attach_sink(sink);
        self.breakers.write().push(breaker.clone());
        breaker
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().iter().find(|b| b.name() == name).cloned()
    }

    pub fn breakers(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().clone()
    }

    pub fn halt(&self) -> &Arc<HaltPropagator> {
        &self.halt
    }

    /// Current tier, re-derived against the clock
    pub fn tier(&self) -> DegradationTier {
        self.evaluate()
    }

    pub fn health_level(&self) -> HealthLevel {
        self.state.lock().health.level()
    }

    pub fn report_failure(&self, source: &str, class: ErrorClass, detail: &str) {
        self.on_signal(GovernanceSignal::Failure {
            source: source.to_string(),
            class,
            detail: detail.to_string(),
        });
    }

    pub fn report_connection_lost(&self, reason: &str) {
        self.on_signal(GovernanceSignal::ConnectionLost {
            reason: reason.to_string(),
        });
    }

    pub fn report_connection_validated(&self, account_id: &str, session_id: u64) {
        self.on_signal(GovernanceSignal::ConnectionValidated {
            account_id: account_id.to_string(),
            session_id,
        });
    }

    /// Re-derive health floors and the tier
    pub fn evaluate(&self) -> DegradationTier {
        let breakers = self.breaker_states();
        let mut state = self.state.lock();
        self.evaluate_locked(&mut state, breakers);
        state.tier
    }

    /// Operator halt: cascade plus the health override to HALTED
    pub fn operator_halt(&self, mode: HaltMode, reason: &str, actor: &str) -> HaltReceipt {
        let reason = format!("operator {actor}: {reason}");
        let breakers = self.breaker_states();
        let mut state = self.state.lock();
        let receipt = self.halt.halt_cascade(mode, &reason);
        let (now, now_ms) = (self.clock.now(), self.clock.wall_millis());
        let outcome = state.health.override_halt(&reason, now, now_ms);
        if outcome.changed() {
            state.last_transition_reason = state.health.last_reason().to_string();
        }
        self.evaluate_locked(&mut state, breakers);
        receipt
    }

    /// Operator release of the cascade halt and of health HALTED
    ///
    /// An unvalidated connection restarts its disconnect timer here, so the
    /// released system gets a full `halt_after` window to re-validate.
    pub fn operator_release(&self, actor: &str) -> Result<(), OperatorError> {
        if actor.trim().is_empty() {
            return Err(HaltError::MissingActor.into());
        }
        let breakers = self.breaker_states();
        let mut state = self.state.lock();
        let (now, now_ms) = (self.clock.now(), self.clock.wall_millis());
        let health_halted = state.health.level() == HealthLevel::Halted;
        let halt_engaged = self.halt.status().engaged;
        if !health_halted && !halt_engaged {
            return Err(OperatorError::NothingToRelease);
        }
        if halt_engaged {
            self.halt.release(actor)?;
        }
        if health_halted {
            state.health.operator_release(actor, now, now_ms)?;
            state.last_transition_reason = state.health.last_reason().to_string();
        }
        if let ConnectionView::Unvalidated { .. } = state.connection {
            state.connection = ConnectionView::Unvalidated { since: now };
        }
        info!("Governance released by {}", actor);
        self.evaluate_locked(&mut state, breakers);
        Ok(())
    }

    pub fn apply_config(&self, health: HealthConfig, degradation: DegradationConfig) {
        let mut state = self.state.lock();
        state.health.set_config(health);
        state.degradation = degradation;
    }

    pub fn snapshot(&self) -> GovernanceSnapshot {
        let breakers: Vec<BreakerSnapshot> = self.breakers().iter().map(|b| b.snapshot()).collect();
        let states = breakers.iter().map(|b| (b.name.clone(), b.state)).collect();
        let mut state = self.state.lock();
        self.evaluate_locked(&mut state, states);
        let now = self.clock.now();
        let connection = ConnectionSnapshot {
            validated: state.connection.is_validated(),
            disconnected_for_ms: state
                .connection
                .unvalidated_for(now)
                .map(|d| d.as_millis() as u64),
            account_id: state.session.as_ref().map(|(a, _)| a.clone()),
            session_id: state.session.as_ref().map(|(_, s)| *s),
        };
        GovernanceSnapshot {
            tier: state.tier,
            tier_reason: state.tier_reason.clone(),
            health: state.health.snapshot(now),
            breakers,
            heartbeat: state.heartbeat,
            connection,
            halt: self.halt.status(),
            last_transition_reason: state.last_transition_reason.clone(),
            taken_at_ms: self.clock.wall_millis(),
        }
    }

    fn breaker_states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers()
            .iter()
            .map(|b| (b.name().to_string(), b.state()))
            .collect()
    }

    fn evaluate_locked(&self, state: &mut CoordinatorState, breakers: BTreeMap<String, CircuitState>) {
        let (now, now_ms) = (self.clock.now(), self.clock.wall_millis());
        let signals = ContributingSignals {
            breakers,
            heartbeat: state.heartbeat,
            connection_validated: state.connection.is_validated(),
        };
        let outcome = state.health.apply_signals(signals, now, now_ms);
        self.after_health(state, outcome.changed(), outcome.entered_halted);
        self.derive_locked(state, now);
    }

    fn after_health(&self, state: &mut CoordinatorState, changed: bool, entered_halted: bool) {
        if changed {
            state.last_transition_reason = state.health.last_reason().to_string();
        }
        if entered_halted && !self.halt.is_cascade_engaged() {
            self.halt
                .halt_cascade(HaltMode::ExitOnly, &format!("health HALTED: {}", state.health.last_reason()));
        }
    }

    fn derive_locked(&self, state: &mut CoordinatorState, now: Instant) {
        let inputs = TierInputs {
            health: state.health.level(),
            connection: state.connection,
            halt_engaged: self.halt.is_cascade_engaged(),
            now,
        };
        let mut decision = derive_tier(&inputs, &state.degradation);
        if decision.disconnect_timeout {
            error!("Disconnect unresolved past limit: {}", decision.reason);
            self.halt.halt_cascade(HaltMode::ExitOnly, &decision.reason);
            decision.reason = format!("halt engaged: {}", decision.reason);
        }
        state.tier_reason = decision.reason.clone();
        if decision.tier == state.tier {
            return;
        }

        let from = state.tier;
        let to = decision.tier;
        state.tier = to;
        state.last_transition_reason = format!("tier {from} -> {to}: {}", decision.reason);
        if to < from {
            warn!("Tier {} -> {}: {}", from, to, decision.reason);
        } else {
            info!("Tier {} -> {}: {}", from, to, decision.reason);
        }
        self.audit.record(
            AuditRecordType::TierChange,
            "coordinator",
            &TierChangeRecord {
                from,
                to,
                reason: &decision.reason,
                health: state.health.level(),
                connection_validated: state.connection.is_validated(),
            },
        );
        let severity = match to {
            DegradationTier::T0 => AlertSeverity::Critical,
            DegradationTier::T1 => AlertSeverity::Warning,
            DegradationTier::T2 => AlertSeverity::Info,
        };
        self.alerts.dispatch(
            Alert::new(
                AlertClass::TierChange,
                severity,
                format!("tier {from} -> {to}: {}", decision.reason),
            )
            .with_detail("from", from)
            .with_detail("to", to),
        );
    }
}

impl SignalSink for GovernanceCoordinator {
    fn on_signal(&self, signal: GovernanceSignal) {
        let breakers = self.breaker_states();
        let mut state = self.state.lock();
        let (now, now_ms) = (self.clock.now(), self.clock.wall_millis());

        let mut failure = None;
        let mut check_passed = false;
        match signal {
            GovernanceSignal::BreakerChanged { breaker, from, to } => {
                info!("Breaker {} {} -> {}", breaker, from, to);
            }
            GovernanceSignal::Heartbeat(status) => {
                state.heartbeat = status;
            }
            GovernanceSignal::ConnectionLost { reason } => {
                if state.connection.is_validated() {
                    warn!("Connection lost: {}", reason);
                    state.connection = ConnectionView::Unvalidated { since: now };
                }
            }
            GovernanceSignal::ConnectionValidated { account_id, session_id } => {
                info!("Connection validated: account {} session {}", account_id, session_id);
                state.connection = ConnectionView::Validated;
                state.session = Some((account_id, session_id));
            }
            GovernanceSignal::Failure { source, class, detail } => {
                warn!("Failure from {} ({:?}): {}", source, class, detail);
                failure = Some((source, class));
            }
            GovernanceSignal::HealthCheckPassed => check_passed = true,
        }

        self.evaluate_locked(&mut state, breakers);
        if let Some((source, class)) = failure {
            let outcome = state.health.record_failure(&source, class, now, now_ms);
            self.after_health(&mut state, outcome.changed(), outcome.entered_halted);
        }
        if check_passed {
            let outcome = state.health.health_check_passed(now, now_ms);
            self.after_health(&mut state, outcome.changed(), outcome.entered_halted);
        }
        self.derive_locked(&mut state, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::core::clock::ManualClock;
    use crate::monitoring::alerts::{AlertConfig, RecordingSink};
    use crate::resilience::halt::HaltConfig;
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        audit: Arc<AuditLog>,
        halt: Arc<HaltPropagator>,
        coordinator: Arc<GovernanceCoordinator>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::shared();
        let audit = Arc::new(AuditLog::in_memory(clock.clone()));
        let alerts = Arc::new(AlertDispatcher::new(
            AlertConfig::default(),
            clock.clone(),
            vec![Arc::new(RecordingSink::new())],
        ));
        let halt = Arc::new(HaltPropagator::new(HaltConfig::default(), clock.clone(), audit.clone()));
        let coordinator = GovernanceCoordinator::new(
            HealthConfig::default(),
            DegradationConfig::default(),
            clock.clone(),
            audit.clone(),
            alerts,
            halt.clone(),
        );
        Fixture {
            clock,
            audit,
            halt,
            coordinator,
        }
    }

    #[test]
    fn test_starts_t1_until_validated() {
        let f = fixture();
        assert_eq!(f.coordinator.tier(), DegradationTier::T1);
        f.coordinator.report_connection_validated("ACC-1", 1);
        assert_eq!(f.coordinator.tier(), DegradationTier::T2);
    }

    #[test]
    fn test_disconnect_revokes_then_halts() {
        let f = fixture();
        f.coordinator.report_connection_validated("ACC-1", 1);
        f.coordinator.report_connection_lost("socket closed");
        assert_eq!(f.coordinator.tier(), DegradationTier::T1);

        f.clock.advance(Duration::from_secs(59));
        assert_eq!(f.coordinator.tier(), DegradationTier::T1);
        assert!(!f.halt.is_cascade_engaged());

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.coordinator.tier(), DegradationTier::T0);
        assert!(f.halt.is_cascade_engaged());
        assert_eq!(f.audit.count(&AuditQuery::of_type(AuditRecordType::HaltEngaged)), 1);

        // reconnection alone does not lift the halt
        f.coordinator.report_connection_validated("ACC-1", 2);
        assert_eq!(f.coordinator.tier(), DegradationTier::T0);
    }

    #[test]
    fn test_breaker_open_degrades_tier() {
        let f = fixture();
        f.coordinator.report_connection_validated("ACC-1", 1);
        let breaker = f
            .coordinator
            .register_breaker("broker.submit", CircuitBreakerConfig::default());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(f.coordinator.health_level(), HealthLevel::Degraded);
        assert_eq!(f.coordinator.tier(), DegradationTier::T1);
    }

    #[test]
    fn test_dead_heartbeat_reaches_critical() {
        let f = fixture();
        f.coordinator.report_connection_validated("ACC-1", 1);
        f.coordinator.on_signal(GovernanceSignal::Heartbeat(HeartbeatStatus::Dead));
        let snapshot = f.coordinator.snapshot();
        assert_eq!(snapshot.health.level, HealthLevel::Critical);
        assert_eq!(snapshot.tier, DegradationTier::T1);
        assert!(snapshot.last_transition_reason.contains("T2 -> T1"));
    }

    #[test]
    fn test_recovery_needs_check_after_timeout() {
        let f = fixture();
        f.coordinator.report_connection_validated("ACC-1", 1);
        for _ in 0..3 {
            f.coordinator.report_failure("broker.submit", ErrorClass::Transient, "timeout");
        }
        assert_eq!(f.coordinator.tier(), DegradationTier::T1);

        f.clock.advance(Duration::from_secs(600));
        assert_eq!(f.coordinator.tier(), DegradationTier::T1);

        f.coordinator.on_signal(GovernanceSignal::HealthCheckPassed);
        assert_eq!(f.coordinator.tier(), DegradationTier::T2);
    }

    #[test]
    fn test_operator_halt_and_release() {
        let f = fixture();
        f.coordinator.report_connection_validated("ACC-1", 1);
        let receipt = f.coordinator.operator_halt(HaltMode::Freeze, "manual stop", "ops");
        assert_eq!(receipt.mode, HaltMode::Freeze);
        assert_eq!(f.coordinator.tier(), DegradationTier::T0);
        assert_eq!(f.coordinator.health_level(), HealthLevel::Halted);

        assert_eq!(
            f.coordinator.operator_release(" "),
            Err(OperatorError::Halt(HaltError::MissingActor))
        );
        f.coordinator.operator_release("ops").unwrap();
        assert!(!f.halt.is_cascade_engaged());
        assert_eq!(f.coordinator.health_level(), HealthLevel::Critical);
        assert_eq!(f.coordinator.tier(), DegradationTier::T1);
        assert_eq!(
            f.coordinator.operator_release("ops"),
            Err(OperatorError::NothingToRelease)
        );
    }
}
