//! Disconnect to T1, unresolved disconnect to T0, operator-driven recovery

use phoenix_core::audit::{AuditQuery, AuditRecordType};
use phoenix_core::governance::{DegradationTier, HealthLevel};
use phoenix_core::resilience::{HaltMode, ReconnectPhase};
use phoenix_core::testing::Harness;
use std::time::Duration;

const STEP: Duration = Duration::from_millis(100);

fn tier_changes(h: &Harness) -> Vec<(String, String)> {
    h.audit
        .query(&AuditQuery::of_type(AuditRecordType::TierChange))
        .iter()
        .map(|r| {
            (
                r.payload["from"].as_str().unwrap_or_default().to_string(),
                r.payload["to"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

#[test]
fn test_disconnect_revokes_full_capability_immediately() {
    let h = Harness::new();
    h.connect().unwrap();
    assert_eq!(h.coordinator.tier(), DegradationTier::T2);

    h.broker.crash();
    h.supervisor.report_disconnect("socket closed");
    h.tick();

    // no virtual time has passed since the report
    assert_eq!(h.coordinator.tier(), DegradationTier::T1);
    assert_eq!(
        tier_changes(&h).last(),
        Some(&("T2".to_string(), "T1".to_string()))
    );
}

#[test]
fn test_unresolved_disconnect_halts_at_sixty_seconds() {
    let h = Harness::new();
    h.connect().unwrap();
    h.broker.crash();
    h.supervisor.report_disconnect("socket closed");
    h.tick();

    h.run_for(Duration::from_millis(59_900), STEP);
    assert_eq!(h.coordinator.tier(), DegradationTier::T1);
    assert!(!h.halt.is_cascade_engaged());

    h.run_for(STEP, STEP);
    assert_eq!(h.coordinator.tier(), DegradationTier::T0);
    assert!(h.halt.is_cascade_engaged());
    assert_eq!(h.halt.cascade_mode(), Some(HaltMode::ExitOnly));

    let changes = tier_changes(&h);
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[2], ("T1".to_string(), "T0".to_string()));
    assert_eq!(h.audit_count(AuditRecordType::HaltEngaged), 1);

    // reconnection stops once the cascade is engaged
    h.tick();
    assert_eq!(h.supervisor.reconnect_phase(), ReconnectPhase::AwaitingOperator);
}

#[test]
fn test_operator_release_and_recovery_to_full_capability() {
    let h = Harness::new();
    h.connect().unwrap();
    h.broker.crash();
    h.supervisor.report_disconnect("socket closed");
    h.run_for(Duration::from_secs(61), STEP);
    assert_eq!(h.coordinator.tier(), DegradationTier::T0);
    h.tick();
    assert_eq!(h.supervisor.reconnect_phase(), ReconnectPhase::AwaitingOperator);

    h.broker.restore();
    h.coordinator.operator_release("ops").unwrap();
    assert!(!h.halt.is_cascade_engaged());
    // released, but still disconnected
    assert_eq!(h.coordinator.tier(), DegradationTier::T1);

    h.supervisor.operator_retry("ops").unwrap();
    h.run_for(Duration::from_secs(5), STEP);
    assert_eq!(h.supervisor.reconnect_phase(), ReconnectPhase::Idle);
    assert!(h.coordinator.snapshot().connection.validated);

    // health walks down one level per passed check after calm
    assert_eq!(h.coordinator.tier(), DegradationTier::T1);
    h.run_for(Duration::from_secs(400), STEP);
    assert_eq!(h.coordinator.health_level(), HealthLevel::Healthy);
    assert_eq!(h.coordinator.tier(), DegradationTier::T2);
    assert!(h.audit.verify().is_ok());
}
