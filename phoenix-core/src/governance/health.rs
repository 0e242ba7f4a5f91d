//! Health state machine
//!
//! ```text
//! HEALTHY ──▶ DEGRADED ──▶ CRITICAL ──▶ HALTED
//!    ◀───────────◀────────────◀── (operator release)
//! ```
//!
//! Escalation walks one level at a time, each step audited. The only jump is
//! the explicit operator override to HALTED. Recovery steps down one level
//! per successful health check, and only once `recovery_timeout` has passed
//! since the last failure and the last transition. HALTED is left only by an
//! operator release.
//!
//! A burst of failures forms one episode: the first failure after
//! `episode_quiet_period` of calm opens a new episode, and each episode emits
//! exactly one `HEALTH_EPISODE` audit record and one alert.
//!
//! The machine is not synchronized itself; the governance coordinator owns it
//! behind its state lock.

use crate::audit::{AuditLog, AuditRecordType};
use crate::core::errors::ErrorClass;
use crate::monitoring::alerts::{Alert, AlertClass, AlertDispatcher, AlertSeverity};
use crate::resilience::circuit_breaker::CircuitState;
use crate::resilience::supervisor::HeartbeatStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Aggregate health level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLevel {
    Healthy = 0,
    Degraded = 1,
    Critical = 2,
    Halted = 3,
}

impl HealthLevel {
    fn up(self) -> Self {
        match self {
            HealthLevel::Healthy => HealthLevel::Degraded,
            HealthLevel::Degraded => HealthLevel::Critical,
            HealthLevel::Critical | HealthLevel::Halted => HealthLevel::Halted,
        }
    }

    fn down(self) -> Self {
        match self {
            HealthLevel::Halted => HealthLevel::Critical,
            HealthLevel::Critical => HealthLevel::Degraded,
            HealthLevel::Degraded | HealthLevel::Healthy => HealthLevel::Healthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "HEALTHY",
            HealthLevel::Degraded => "DEGRADED",
            HealthLevel::Critical => "CRITICAL",
            HealthLevel::Halted => "HALTED",
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for health aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Failures in window that move HEALTHY → DEGRADED
    pub degraded_failures: u32,
    /// Failures in window that move DEGRADED → CRITICAL
    pub critical_failures: u32,
    /// Failures in window that move CRITICAL → HALTED (None = override only)
    pub halt_failures: Option<u32>,
    pub failure_window: Duration,
    /// Calm required before stepping down a level
    pub recovery_timeout: Duration,
    /// Calm that separates two failure episodes
    pub episode_quiet_period: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_failures: 3,
            critical_failures: 10,
            halt_failures: None,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(120),
            episode_quiet_period: Duration::from_secs(30),
        }
    }
}

impl HealthConfig {
    fn demanded_by_count(&self, failures: u32) -> HealthLevel {
        match self.halt_failures {
            Some(halt) if failures >= halt => return HealthLevel::Halted,
            _ => {}
        }
        if failures >= self.critical_failures {
            HealthLevel::Critical
        } else if failures >= self.degraded_failures {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        }
    }
}

/// Signals the health level is computed from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContributingSignals {
    pub breakers: BTreeMap<String, CircuitState>,
    pub heartbeat: HeartbeatStatus,
    pub connection_validated: bool,
}

impl Default for ContributingSignals {
    fn default() -> Self {
        Self {
            breakers: BTreeMap::new(),
            heartbeat: HeartbeatStatus::Alive,
            connection_validated: false,
        }
    }
}

impl ContributingSignals {
    /// Lowest level these signals allow
    pub fn floor(&self) -> HealthLevel {
        let heartbeat = match self.heartbeat {
            HeartbeatStatus::Dead => HealthLevel::Critical,
            HeartbeatStatus::Suspect { .. } => HealthLevel::Degraded,
            HeartbeatStatus::Alive => HealthLevel::Healthy,
        };
        let breaker = if self.breakers.values().any(|s| *s == CircuitState::Open) {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        };
        heartbeat.max(breaker)
    }
}

/// Read-only view of the health machine
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub level: HealthLevel,
    pub signals: ContributingSignals,
    pub last_transition_at_ms: u64,
    pub last_reason: String,
    pub episode_id: u64,
    pub episode_failures: u64,
    pub failures_in_window: u32,
    pub total_failures: u64,
}

/// Side effects the coordinator must carry out
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthOutcome {
    pub transitions: Vec<(HealthLevel, HealthLevel)>,
    /// HALTED was entered; the halt cascade must be engaged
    pub entered_halted: bool,
}

impl HealthOutcome {
    pub fn changed(&self) -> bool {
        !self.transitions.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    #[error("operator release requires a named operator")]
    MissingActor,

    #[error("health is {0}, not HALTED")]
    NotHalted(HealthLevel),
}

#[derive(Serialize)]
struct HealthTransitionRecord<'a> {
    from: HealthLevel,
    to: HealthLevel,
    reason: &'a str,
    #[serde(rename = "override")]
    is_override: bool,
    episode_id: u64,
}

#[derive(Serialize)]
struct HealthEpisodeRecord<'a> {
    episode_id: u64,
    first_source: &'a str,
    class: ErrorClass,
    level: HealthLevel,
}

/// The health state machine
pub struct HealthMachine {
    config: HealthConfig,
    audit: Arc<AuditLog>,
    alerts: Arc<AlertDispatcher>,
    level: HealthLevel,
    signals: ContributingSignals,
    failures: VecDeque<Instant>,
    last_failure_at: Option<Instant>,
    last_transition_at: Instant,
    last_transition_at_ms: u64,
    last_reason: String,
    episode_id: u64,
    episode_failures: u64,
    total_failures: u64,
}

impl fmt::Debug for HealthMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMachine")
            .field("level", &self.level)
            .field("episode_id", &self.episode_id)
            .finish()
    }
}

impl HealthMachine {
    pub fn new(
        config: HealthConfig,
        audit: Arc<AuditLog>,
        alerts: Arc<AlertDispatcher>,
        now: Instant,
        now_ms: u64,
    ) -> Self {
        Self {
            config,
            audit,
            alerts,
            level: HealthLevel::Healthy,
            signals: ContributingSignals::default(),
            failures: VecDeque::new(),
            last_failure_at: None,
            last_transition_at: now,
            last_transition_at_ms: now_ms,
            last_reason: "initial".to_string(),
            episode_id: 0,
            episode_failures: 0,
            total_failures: 0,
        }
    }

    pub fn level(&self) -> HealthLevel {
        self.level
    }

    pub fn last_reason(&self) -> &str {
        &self.last_reason
    }

    pub fn set_config(&mut self, config: HealthConfig) {
        self.config = config;
    }

    /// Count one classified failure
    pub fn record_failure(
        &mut self,
        source: &str,
        class: ErrorClass,
        now: Instant,
        now_ms: u64,
    ) -> HealthOutcome {
        let new_episode = self
            .last_failure_at
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.episode_quiet_period);
        if new_episode {
            self.episode_id += 1;
            self.episode_failures = 0;
            warn!(
                "Health episode {} opened by {} ({:?})",
                self.episode_id, source, class
            );
            self.audit.record(
                AuditRecordType::HealthEpisode,
                "health",
                &HealthEpisodeRecord {
                    episode_id: self.episode_id,
                    first_source: source,
                    class,
                    level: self.level,
                },
            );
            self.alerts.dispatch(
                Alert::new(
                    AlertClass::HealthEpisode,
                    AlertSeverity::Warning,
                    format!("failure episode {} opened by {}", self.episode_id, source),
                )
                .with_detail("episode_id", self.episode_id)
                .with_detail("class", format!("{class:?}")),
            );
        }
        self.episode_failures += 1;
        self.total_failures += 1;
        self.last_failure_at = Some(now);
        self.prune(now);
        self.failures.push_back(now);

        let mut demand = self.config.demanded_by_count(self.failures.len() as u32);
        demand = demand.max(match class {
            ErrorClass::Transient | ErrorClass::Degraded => HealthLevel::Healthy,
            ErrorClass::Critical => HealthLevel::Critical,
            ErrorClass::Fatal => HealthLevel::Halted,
        });
        demand = demand.max(self.signals.floor());

        let reason = format!(
            "{} failures in window (last from {})",
            self.failures.len(),
            source
        );
        self.escalate_to(demand, &reason, now, now_ms)
    }

    /// Replace the contributing signals and escalate to their floor
    pub fn apply_signals(
        &mut self,
        signals: ContributingSignals,
        now: Instant,
        now_ms: u64,
    ) -> HealthOutcome {
        let floor = signals.floor();
        let reason = describe_floor(&signals);
        self.signals = signals;
        self.escalate_to(floor, &reason, now, now_ms)
    }

    /// A fresh health check succeeded: step down one level if allowed
    pub fn health_check_passed(&mut self, now: Instant, now_ms: u64) -> HealthOutcome {
        let mut outcome = HealthOutcome::default();
        if matches!(self.level, HealthLevel::Healthy | HealthLevel::Halted) {
            return outcome;
        }
        let calm_since = self
            .last_failure_at
            .map_or(self.last_transition_at, |f| f.max(self.last_transition_at));
        if now.saturating_duration_since(calm_since) < self.config.recovery_timeout {
            return outcome;
        }
        if !self.signals.connection_validated {
            return outcome;
        }
        let target = self.level.down();
        if target < self.signals.floor() {
            return outcome;
        }
        self.transition(target, "recovery: timeout elapsed and health check passed", false, now, now_ms, &mut outcome);
        outcome
    }

    /// Explicit operator (or fatal-policy) jump to HALTED
    pub fn override_halt(&mut self, reason: &str, now: Instant, now_ms: u64) -> HealthOutcome {
        let mut outcome = HealthOutcome::default();
        if self.level != HealthLevel::Halted {
            self.transition(HealthLevel::Halted, reason, true, now, now_ms, &mut outcome);
        }
        outcome
    }

    /// Operator release: HALTED → CRITICAL
    pub fn operator_release(
        &mut self,
        actor: &str,
        now: Instant,
        now_ms: u64,
    ) -> Result<HealthOutcome, HealthError> {
        if actor.trim().is_empty() {
            return Err(HealthError::MissingActor);
        }
        if self.level != HealthLevel::Halted {
            return Err(HealthError::NotHalted(self.level));
        }
        let mut outcome = HealthOutcome::default();
        let reason = format!("operator release by {actor}");
        self.transition(HealthLevel::Critical, &reason, true, now, now_ms, &mut outcome);
        Ok(outcome)
    }

    pub fn snapshot(&mut self, now: Instant) -> HealthSnapshot {
        self.prune(now);
        HealthSnapshot {
            level: self.level,
            signals: self.signals.clone(),
            last_transition_at_ms: self.last_transition_at_ms,
            last_reason: self.last_reason.clone(),
            episode_id: self.episode_id,
            episode_failures: self.episode_failures,
            failures_in_window: self.failures.len() as u32,
            total_failures: self.total_failures,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= self.config.failure_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn escalate_to(
        &mut self,
        target: HealthLevel,
        reason: &str,
        now: Instant,
        now_ms: u64,
    ) -> HealthOutcome {
        let mut outcome = HealthOutcome::default();
        while self.level < target {
            let next = self.level.up();
            self.transition(next, reason, false, now, now_ms, &mut outcome);
        }
        outcome
    }

    fn transition(
        &mut self,
        to: HealthLevel,
        reason: &str,
        is_override: bool,
        now: Instant,
        now_ms: u64,
        outcome: &mut HealthOutcome,
    ) {
        let from = self.level;
        self.level = to;
        self.last_transition_at = now;
        self.last_transition_at_ms = now_ms;
        self.last_reason = format!("{from} -> {to}: {reason}");

        if to > from {
            warn!("Health {} -> {} ({})", from, to, reason);
        } else {
            info!("Health {} -> {} ({})", from, to, reason);
        }
        self.audit.record(
            AuditRecordType::HealthTransition,
            "health",
            &HealthTransitionRecord {
                from,
                to,
                reason,
                is_override,
                episode_id: self.episode_id,
            },
        );

        match to {
            HealthLevel::Critical if from < to => {
                self.alerts.dispatch(
                    Alert::critical(AlertClass::HealthCritical, format!("health CRITICAL: {reason}"))
                        .with_detail("episode_id", self.episode_id),
                );
            }
            HealthLevel::Halted => {
                error!("Health HALTED ({}) - engaging halt cascade", reason);
                outcome.entered_halted = true;
            }
            _ => {}
        }
        outcome.transitions.push((from, to));
    }
}

fn describe_floor(signals: &ContributingSignals) -> String {
    let open: Vec<&str> = signals
        .breakers
        .iter()
        .filter(|(_, s)| **s == CircuitState::Open)
        .map(|(name, _)| name.as_str())
        .collect();
    match (&signals.heartbeat, open.is_empty()) {
        (HeartbeatStatus::Dead, _) => "broker heartbeat DEAD".to_string(),
        (HeartbeatStatus::Suspect { missed }, _) => format!("{missed} heartbeats missed"),
        (_, false) => format!("circuit breaker open: {}", open.join(", ")),
        _ => "signals nominal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::core::clock::{Clock, ManualClock};
    use crate::monitoring::alerts::{AlertConfig, RecordingSink};

    struct Fixture {
        clock: Arc<ManualClock>,
        audit: Arc<AuditLog>,
        sink: Arc<RecordingSink>,
        machine: HealthMachine,
    }

    fn fixture(config: HealthConfig) -> Fixture {
        let clock = ManualClock::shared();
        let audit = Arc::new(AuditLog::in_memory(clock.clone()));
        let sink = Arc::new(RecordingSink::new());
        let alerts = Arc::new(AlertDispatcher::new(
            AlertConfig::default(),
            clock.clone(),
            vec![sink.clone()],
        ));
        let machine = HealthMachine::new(config, audit.clone(), alerts, clock.now(), clock.wall_millis());
        Fixture { clock, audit, sink, machine }
    }

    fn fail(f: &mut Fixture) -> HealthOutcome {
        let (now, ms) = (f.clock.now(), f.clock.wall_millis());
        f.machine.record_failure("broker.submit", ErrorClass::Transient, now, ms)
    }

    fn validated() -> ContributingSignals {
        ContributingSignals {
            connection_validated: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_escalation_follows_thresholds() {
        let mut f = fixture(HealthConfig {
            degraded_failures: 2,
            critical_failures: 4,
            ..Default::default()
        });
        fail(&mut f);
        assert_eq!(f.machine.level(), HealthLevel::Healthy);
        fail(&mut f);
        assert_eq!(f.machine.level(), HealthLevel::Degraded);
        fail(&mut f);
        let outcome = fail(&mut f);
        assert_eq!(f.machine.level(), HealthLevel::Critical);
        assert_eq!(outcome.transitions, vec![(HealthLevel::Degraded, HealthLevel::Critical)]);
        assert_eq!(f.sink.count(AlertClass::HealthCritical), 1);
    }

    #[test]
    fn test_dead_heartbeat_walks_each_level() {
        let mut f = fixture(HealthConfig::default());
        let (now, ms) = (f.clock.now(), f.clock.wall_millis());
        let outcome = f.machine.apply_signals(
            ContributingSignals {
                heartbeat: HeartbeatStatus::Dead,
                ..Default::default()
            },
            now,
            ms,
        );
        assert_eq!(
            outcome.transitions,
            vec![
                (HealthLevel::Healthy, HealthLevel::Degraded),
                (HealthLevel::Degraded, HealthLevel::Critical),
            ]
        );
        assert_eq!(f.audit.count(&AuditQuery::of_type(AuditRecordType::HealthTransition)), 2);
    }

    #[test]
    fn test_burst_is_one_episode() {
        let mut f = fixture(HealthConfig::default());
        for _ in 0..100 {
            fail(&mut f);
            f.clock.advance(Duration::from_millis(10));
        }
        assert_eq!(f.audit.count(&AuditQuery::of_type(AuditRecordType::HealthEpisode)), 1);
        assert_eq!(f.sink.count(AlertClass::HealthEpisode), 1);

        // quiet period elapses: the next failure opens episode 2
        f.clock.advance(Duration::from_secs(30));
        fail(&mut f);
        let snapshot = f.machine.snapshot(f.clock.now());
        assert_eq!(snapshot.episode_id, 2);
        assert_eq!(snapshot.total_failures, 101);
    }

    #[test]
    fn test_recovery_is_never_time_only() {
        let mut f = fixture(HealthConfig {
            degraded_failures: 1,
            ..Default::default()
        });
        let (now, ms) = (f.clock.now(), f.clock.wall_millis());
        f.machine.apply_signals(validated(), now, ms);
        fail(&mut f);
        assert_eq!(f.machine.level(), HealthLevel::Degraded);

        // time alone does not recover
        f.clock.advance(Duration::from_secs(600));
        assert_eq!(f.machine.level(), HealthLevel::Degraded);

        // a check before the timeout does not recover either
        let mut g = fixture(HealthConfig {
            degraded_failures: 1,
            ..Default::default()
        });
        let (now, ms) = (g.clock.now(), g.clock.wall_millis());
        g.machine.apply_signals(validated(), now, ms);
        fail(&mut g);
        g.clock.advance(Duration::from_secs(119));
        let (now, ms) = (g.clock.now(), g.clock.wall_millis());
        assert!(!g.machine.health_check_passed(now, ms).changed());

        // timeout plus check does
        let (now, ms) = (f.clock.now(), f.clock.wall_millis());
        let outcome = f.machine.health_check_passed(now, ms);
        assert_eq!(outcome.transitions, vec![(HealthLevel::Degraded, HealthLevel::Healthy)]);
    }

    #[test]
    fn test_recovery_requires_validated_connection_and_clear_floor() {
        let mut f = fixture(HealthConfig {
            degraded_failures: 1,
            ..Default::default()
        });
        fail(&mut f);
        f.clock.advance(Duration::from_secs(600));
        let (now, ms) = (f.clock.now(), f.clock.wall_millis());
        assert!(!f.machine.health_check_passed(now, ms).changed());

        let mut breakers = BTreeMap::new();
        breakers.insert("broker.submit".to_string(), CircuitState::Open);
        f.machine.apply_signals(
            ContributingSignals {
                breakers,
                connection_validated: true,
                ..Default::default()
            },
            now,
            ms,
        );
        assert!(!f.machine.health_check_passed(now, ms).changed());
    }

    #[test]
    fn test_override_and_release() {
        let mut f = fixture(HealthConfig::default());
        let (now, ms) = (f.clock.now(), f.clock.wall_millis());
        let outcome = f.machine.override_halt("operator stop", now, ms);
        assert!(outcome.entered_halted);
        assert_eq!(outcome.transitions, vec![(HealthLevel::Healthy, HealthLevel::Halted)]);

        let records = f.audit.query(&AuditQuery::of_type(AuditRecordType::HealthTransition));
        assert_eq!(records[0].payload["override"], true);

        // recovery checks never leave HALTED
        f.clock.advance(Duration::from_secs(3600));
        let (now, ms) = (f.clock.now(), f.clock.wall_millis());
        assert!(!f.machine.health_check_passed(now, ms).changed());

        assert_eq!(f.machine.operator_release("", now, ms), Err(HealthError::MissingActor));
        f.machine.operator_release("ops", now, ms).unwrap();
        assert_eq!(f.machine.level(), HealthLevel::Critical);
    }

    #[test]
    fn test_fatal_failure_escalates_to_halted_stepwise() {
        let mut f = fixture(HealthConfig::default());
        let (now, ms) = (f.clock.now(), f.clock.wall_millis());
        let outcome = f.machine.record_failure("audit", ErrorClass::Fatal, now, ms);
        assert_eq!(outcome.transitions.len(), 3);
        assert!(outcome.entered_halted);
    }
}
