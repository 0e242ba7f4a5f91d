//! Prometheus metrics for the governance layer
//!
//! Gauges are refreshed from a [`RuntimeStatus`] snapshot by
//! [`MetricsRegistry::observe`]; nothing on the hot path touches the
//! registry.
//!
//! Encodings:
//! - tier: T0 = 0, T1 = 1, T2 = 2
//! - health: HEALTHY = 0, DEGRADED = 1, CRITICAL = 2, HALTED = 3
//! - halt mode: none = 0, EXIT_ONLY = 1, FREEZE = 2
//! - breaker state: CLOSED = 0, HALF_OPEN = 1, OPEN = 2

use crate::core::position_fsm::PositionState;
use crate::engine::runtime::RuntimeStatus;
use crate::governance::{DegradationTier, HealthLevel};
use crate::resilience::halt::HaltMode;
use crate::resilience::supervisor::HeartbeatStatus;
use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Arc;
use tracing::info;

/// Central registry for all Prometheus metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    governance: Arc<GovernanceMetrics>,
    lifecycle: Arc<LifecycleMetrics>,
    system: Arc<SystemMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let governance = Arc::new(GovernanceMetrics::new(&registry)?);
        let lifecycle = Arc::new(LifecycleMetrics::new(&registry)?);
        let system = Arc::new(SystemMetrics::new(&registry)?);

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            governance,
            lifecycle,
            system,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn governance(&self) -> &GovernanceMetrics {
        &self.governance
    }

    pub fn lifecycle(&self) -> &LifecycleMetrics {
        &self.lifecycle
    }

    pub fn system(&self) -> &SystemMetrics {
        &self.system
    }

    /// Refresh every gauge from a status snapshot
    pub fn observe(&self, status: &RuntimeStatus) {
        let g = &self.governance;
        g.tier.set(tier_value(status.tier));
        g.health_level.set(health_value(status.health));
        g.halt_mode.set(halt_value(status.governance.halt.mode));
        g.failures_in_window
            .set(status.governance.health.failures_in_window as i64);
        for breaker in &status.governance.breakers {
            g.breaker_state
                .with_label_values(&[breaker.name.as_str()])
                .set(breaker.state.as_gauge());
            g.breaker_trips
                .with_label_values(&[breaker.name.as_str()])
                .set(breaker.trips as i64);
        }
        g.connection_validated
            .set(status.governance.connection.validated as i64);

        let l = &self.lifecycle;
        for state in PositionState::ALL {
            let count = status.positions.get(&state).copied().unwrap_or(0);
            l.positions_by_state
                .with_label_values(&[state.as_str()])
                .set(count as i64);
        }
        l.open_drift_records.set(status.reconciliation.open_records as i64);
        l.open_critical_drift.set(status.reconciliation.open_critical as i64);
        l.reconciliation_runs.set(status.reconciliation.runs as i64);
        l.reconciliation_deferred
            .set(status.reconciliation.deferred as i64);

        let s = &self.system;
        s.heartbeat_status
            .set(heartbeat_value(status.supervisor.heartbeat));
        s.heartbeat_missed.set(status.supervisor.missed_count as i64);
        s.reconnect_attempt
            .set(status.supervisor.reconnect_attempt as i64);
        s.supervisor_liveness_age_ms
            .set(status.supervisor.liveness_age_ms.map_or(-1, |ms| ms as i64));
        s.audit_records.set(status.audit_records as i64);
        s.audit_write_failures.set(status.audit_write_failures as i64);
        s.alerts_delivered.set(status.alerts.delivered as i64);
        s.alerts_suppressed
            .set((status.alerts.debounced + status.alerts.rate_limited) as i64);
        s.uptime_seconds.set((status.uptime_ms / 1000) as i64);
    }
}

fn tier_value(tier: DegradationTier) -> i64 {
    match tier {
        DegradationTier::T0 => 0,
        DegradationTier::T1 => 1,
        DegradationTier::T2 => 2,
    }
}

fn health_value(level: HealthLevel) -> i64 {
    match level {
        HealthLevel::Healthy => 0,
        HealthLevel::Degraded => 1,
        HealthLevel::Critical => 2,
        HealthLevel::Halted => 3,
    }
}

fn halt_value(mode: Option<HaltMode>) -> i64 {
    match mode {
        None => 0,
        Some(HaltMode::ExitOnly) => 1,
        Some(HaltMode::Freeze) => 2,
    }
}

fn heartbeat_value(status: HeartbeatStatus) -> i64 {
    match status {
        HeartbeatStatus::Alive => 0,
        HeartbeatStatus::Suspect { .. } => 1,
        HeartbeatStatus::Dead => 2,
    }
}

/// Tier, health, halt and breaker state
pub struct GovernanceMetrics {
    pub tier: IntGauge,
    pub health_level: IntGauge,
    pub halt_mode: IntGauge,
    pub failures_in_window: IntGauge,
    pub breaker_state: IntGaugeVec,
    pub breaker_trips: IntGaugeVec,
    /// 1 once the broker session passed identity validation
    pub connection_validated: IntGauge,
}

impl GovernanceMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let tier = IntGauge::new("phoenix_governance_tier", "Capability tier (T0=0, T1=1, T2=2)")?;
        registry.register(Box::new(tier.clone()))?;

        let health_level = IntGauge::new(
            "phoenix_governance_health_level",
            "Health level (HEALTHY=0, DEGRADED=1, CRITICAL=2, HALTED=3)",
        )?;
        registry.register(Box::new(health_level.clone()))?;

        let halt_mode = IntGauge::new(
            "phoenix_governance_halt_mode",
            "Cascade halt mode (none=0, EXIT_ONLY=1, FREEZE=2)",
        )?;
        registry.register(Box::new(halt_mode.clone()))?;

        let failures_in_window = IntGauge::new(
            "phoenix_governance_failures_in_window",
            "Classified failures inside the health failure window",
        )?;
        registry.register(Box::new(failures_in_window.clone()))?;

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "governance_breaker_state",
                "Circuit breaker state (CLOSED=0, HALF_OPEN=1, OPEN=2)",
            )
            .namespace("phoenix"),
            &["breaker"],
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let breaker_trips = IntGaugeVec::new(
            Opts::new("governance_breaker_trips", "Times the breaker has opened")
                .namespace("phoenix"),
            &["breaker"],
        )?;
        registry.register(Box::new(breaker_trips.clone()))?;

        let connection_validated = IntGauge::new(
            "phoenix_governance_connection_validated",
            "Broker session validated (1) or not (0)",
        )?;
        registry.register(Box::new(connection_validated.clone()))?;

        Ok(Self {
            tier,
            health_level,
            halt_mode,
            failures_in_window,
            breaker_state,
            breaker_trips,
            connection_validated,
        })
    }
}

/// Positions and reconciliation drift
pub struct LifecycleMetrics {
    pub positions_by_state: IntGaugeVec,
    pub open_drift_records: IntGauge,
    pub open_critical_drift: IntGauge,
    pub reconciliation_runs: IntGauge,
    pub reconciliation_deferred: IntGauge,
}

impl LifecycleMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let positions_by_state = IntGaugeVec::new(
            Opts::new("lifecycle_positions", "Positions by lifecycle state").namespace("phoenix"),
            &["state"],
        )?;
        registry.register(Box::new(positions_by_state.clone()))?;

        let open_drift_records = IntGauge::new(
            "phoenix_reconciliation_open_records",
            "Unresolved reconciliation records",
        )?;
        registry.register(Box::new(open_drift_records.clone()))?;

        let open_critical_drift = IntGauge::new(
            "phoenix_reconciliation_open_critical",
            "Unresolved CRITICAL reconciliation records",
        )?;
        registry.register(Box::new(open_critical_drift.clone()))?;

        let reconciliation_runs = IntGauge::new(
            "phoenix_reconciliation_runs",
            "Reconciliation runs admitted so far",
        )?;
        registry.register(Box::new(reconciliation_runs.clone()))?;

        let reconciliation_deferred = IntGauge::new(
            "phoenix_reconciliation_deferred",
            "Reconciliation passes deferred by the rate limit",
        )?;
        registry.register(Box::new(reconciliation_deferred.clone()))?;

        Ok(Self {
            positions_by_state,
            open_drift_records,
            open_critical_drift,
            reconciliation_runs,
            reconciliation_deferred,
        })
    }
}

/// Supervisor, audit and alert channel health
pub struct SystemMetrics {
    /// ALIVE=0, SUSPECT=1, DEAD=2
    pub heartbeat_status: IntGauge,
    pub heartbeat_missed: IntGauge,
    pub reconnect_attempt: IntGauge,
    /// Milliseconds since the last liveness record (-1 before the first)
    pub supervisor_liveness_age_ms: IntGauge,
    pub audit_records: IntGauge,
    pub audit_write_failures: IntGauge,
    pub alerts_delivered: IntGauge,
    pub alerts_suppressed: IntGauge,
    pub uptime_seconds: IntGauge,
}

impl SystemMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let heartbeat_status = IntGauge::new(
            "phoenix_system_heartbeat_status",
            "Broker heartbeat (ALIVE=0, SUSPECT=1, DEAD=2)",
        )?;
        registry.register(Box::new(heartbeat_status.clone()))?;

        let heartbeat_missed = IntGauge::new(
            "phoenix_system_heartbeat_missed",
            "Consecutive missed heartbeat intervals",
        )?;
        registry.register(Box::new(heartbeat_missed.clone()))?;

        let reconnect_attempt = IntGauge::new(
            "phoenix_system_reconnect_attempt",
            "Current reconnection attempt (0 when idle)",
        )?;
        registry.register(Box::new(reconnect_attempt.clone()))?;

        let supervisor_liveness_age_ms = IntGauge::new(
            "phoenix_system_supervisor_liveness_age_ms",
            "Milliseconds since the supervisor last proved liveness",
        )?;
        registry.register(Box::new(supervisor_liveness_age_ms.clone()))?;

        let audit_records = IntGauge::new("phoenix_system_audit_records", "Audit records in the chain")?;
        registry.register(Box::new(audit_records.clone()))?;

        let audit_write_failures = IntGauge::new(
            "phoenix_system_audit_write_failures",
            "Audit records that failed to persist",
        )?;
        registry.register(Box::new(audit_write_failures.clone()))?;

        let alerts_delivered = IntGauge::new(
            "phoenix_system_alerts_delivered",
            "Alerts delivered to at least one sink",
        )?;
        registry.register(Box::new(alerts_delivered.clone()))?;

        let alerts_suppressed = IntGauge::new(
            "phoenix_system_alerts_suppressed",
            "Alerts debounced or rate limited",
        )?;
        registry.register(Box::new(alerts_suppressed.clone()))?;

        let uptime_seconds = IntGauge::new("phoenix_system_uptime_seconds", "Runtime uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            heartbeat_status,
            heartbeat_missed,
            reconnect_attempt,
            supervisor_liveness_age_ms,
            audit_records,
            audit_write_failures,
            alerts_delivered,
            alerts_suppressed,
            uptime_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{FaultProfile, SimulatedBroker};
    use crate::config::PhoenixConfig;
    use crate::core::clock::ManualClock;
    use crate::engine::runtime::PhoenixRuntime;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new().unwrap();
        assert!(!registry.registry().gather().is_empty());
    }

    #[test]
    fn test_observe_runtime_status() {
        let clock = ManualClock::shared();
        let broker = Arc::new(SimulatedBroker::new("PAPER-001", FaultProfile::perfect(), clock.clone()));
        let runtime = PhoenixRuntime::new(PhoenixConfig::default(), clock, broker).unwrap();
        runtime.connect().unwrap();

        let registry = MetricsRegistry::new().unwrap();
        registry.observe(&runtime.status());

        assert_eq!(registry.governance().tier.get(), 2);
        assert_eq!(registry.governance().health_level.get(), 0);
        assert_eq!(
            registry
                .governance()
                .breaker_state
                .with_label_values(&["broker.submit"])
                .get(),
            0
        );
        assert_eq!(
            registry
                .lifecycle()
                .positions_by_state
                .with_label_values(&["PROPOSED"])
                .get(),
            0
        );
        assert!(registry.system().audit_records.get() > 0);
    }
}
