//! Failure storms, episodes and step-wise recovery of the health machine

use phoenix_core::audit::AuditRecordType;
use phoenix_core::core::ErrorClass;
use phoenix_core::governance::{DegradationTier, GovernanceSignal, HealthLevel, SignalSink};
use phoenix_core::monitoring::AlertClass;
use phoenix_core::testing::Harness;
use std::time::Duration;

fn storm(h: &Harness, failures: usize, spacing: Duration) {
    for _ in 0..failures {
        h.advance(spacing);
        h.coordinator
            .report_failure("broker.submit", ErrorClass::Transient, "request timed out");
    }
}

#[test]
fn test_failure_storm_is_one_episode() {
    let h = Harness::new();
    h.connect().unwrap();

    // 100 failures inside one second
    storm(&h, 100, Duration::from_millis(10));

    assert_eq!(h.audit_count(AuditRecordType::HealthEpisode), 1);
    assert_eq!(h.recorder.count(AlertClass::HealthEpisode), 1);
    assert_eq!(h.coordinator.health_level(), HealthLevel::Critical);
    // HEALTHY -> DEGRADED -> CRITICAL, one record per step
    assert_eq!(h.audit_count(AuditRecordType::HealthTransition), 2);
    assert_eq!(h.coordinator.tier(), DegradationTier::T1);
}

#[test]
fn test_quiet_period_separates_episodes() {
    let h = Harness::new();
    h.connect().unwrap();

    storm(&h, 5, Duration::from_millis(100));
    h.advance(Duration::from_secs(29));
    storm(&h, 1, Duration::ZERO);
    assert_eq!(h.audit_count(AuditRecordType::HealthEpisode), 1);

    h.advance(Duration::from_secs(30));
    storm(&h, 1, Duration::ZERO);
    assert_eq!(h.audit_count(AuditRecordType::HealthEpisode), 2);
    assert_eq!(h.recorder.count(AlertClass::HealthEpisode), 2);
}

#[test]
fn test_time_alone_never_recovers() {
    let h = Harness::new();
    h.connect().unwrap();
    storm(&h, 10, Duration::from_millis(10));
    assert_eq!(h.coordinator.health_level(), HealthLevel::Critical);

    h.advance(Duration::from_secs(600));
    h.coordinator.evaluate();
    assert_eq!(h.coordinator.health_level(), HealthLevel::Critical);

    h.coordinator.on_signal(GovernanceSignal::HealthCheckPassed);
    assert_eq!(h.coordinator.health_level(), HealthLevel::Degraded);

    // the step down restarts the recovery timer
    h.coordinator.on_signal(GovernanceSignal::HealthCheckPassed);
    assert_eq!(h.coordinator.health_level(), HealthLevel::Degraded);

    h.advance(Duration::from_secs(120));
    h.coordinator.on_signal(GovernanceSignal::HealthCheckPassed);
    assert_eq!(h.coordinator.health_level(), HealthLevel::Healthy);
    assert_eq!(h.coordinator.tier(), DegradationTier::T2);
}

#[test]
fn test_critical_failure_jumps_floor() {
    let h = Harness::new();
    h.connect().unwrap();

    h.coordinator
        .report_failure("reconciliation", ErrorClass::Critical, "POSITION_COUNT");

    assert_eq!(h.coordinator.health_level(), HealthLevel::Critical);
    assert_eq!(h.audit_count(AuditRecordType::HealthTransition), 2);
}

#[test]
fn test_fatal_failure_halts_and_cascades() {
    let h = Harness::new();
    h.connect().unwrap();

    h.coordinator
        .report_failure("broker.submit", ErrorClass::Fatal, "account disabled");

    assert_eq!(h.coordinator.health_level(), HealthLevel::Halted);
    assert!(h.halt.is_cascade_engaged());
    assert_eq!(h.coordinator.tier(), DegradationTier::T0);
}
