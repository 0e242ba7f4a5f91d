//! Halt delivery bounds and release semantics

use phoenix_core::audit::AuditRecordType;
use phoenix_core::core::ActionKind;
use phoenix_core::governance::{DegradationTier, HealthLevel};
use phoenix_core::resilience::{HaltError, HaltMode, HaltScope};
use phoenix_core::testing::Harness;
use std::time::Duration;

#[test]
fn test_local_halt_within_fifty_millis() {
    let h = Harness::new();
    let switch = h.halt.switch("strategy.momentum");

    let receipt = h
        .halt
        .halt_local("strategy.momentum", HaltMode::ExitOnly, "drawdown limit")
        .unwrap();

    assert_eq!(receipt.scope, HaltScope::Local);
    assert!(receipt.within_bound);
    assert!(receipt.latency <= Duration::from_millis(50));
    assert_eq!(switch.check(ActionKind::CapitalCommitting), Err(HaltMode::ExitOnly));
    assert_eq!(switch.check(ActionKind::RiskReducing), Ok(()));

    // a local halt leaves everything else alone
    assert!(!h.halt.is_cascade_engaged());
    assert!(!h.halt.switch("lifecycle").is_engaged());
}

#[test]
fn test_cascade_within_five_hundred_millis() {
    let h = Harness::new();
    let switches: Vec<_> = (0..64)
        .map(|i| h.halt.switch(&format!("component.{i}")))
        .collect();
    let token = h.halt.interrupt_token();

    let receipt = h.halt.halt_cascade(HaltMode::Freeze, "kill switch");

    assert_eq!(receipt.scope, HaltScope::Cascade);
    assert!(receipt.within_bound);
    assert!(receipt.latency <= Duration::from_millis(500));
    // 64 registered here plus the lifecycle switch
    assert_eq!(receipt.components.len(), 65);
    assert!(switches.iter().all(|s| s.mode() == Some(HaltMode::Freeze)));
    assert!(token.is_cancelled());
    assert_eq!(h.audit_count(AuditRecordType::HaltEngaged), 1);
}

#[test]
fn test_unknown_component_is_an_error() {
    let h = Harness::new();
    assert_eq!(
        h.halt
            .halt_local("nope", HaltMode::Freeze, "typo")
            .map(|r| r.scope),
        Err(HaltError::UnknownComponent("nope".to_string()))
    );
}

#[test]
fn test_late_registration_starts_halted() {
    let h = Harness::new();
    h.halt.halt_cascade(HaltMode::ExitOnly, "incident");
    let late = h.halt.switch("late.component");
    assert_eq!(late.mode(), Some(HaltMode::ExitOnly));
}

#[test]
fn test_operator_halt_and_release() {
    let h = Harness::new();
    h.connect().unwrap();

    let receipt = h.coordinator.operator_halt(HaltMode::ExitOnly, "market event", "ops");
    assert!(receipt.within_bound);
    assert_eq!(h.coordinator.health_level(), HealthLevel::Halted);
    assert_eq!(h.coordinator.tier(), DegradationTier::T0);

    // halts are never released on time alone
    h.advance(Duration::from_secs(3_600));
    assert_eq!(h.coordinator.tier(), DegradationTier::T0);

    assert!(h.coordinator.operator_release("").is_err());
    h.coordinator.operator_release("ops").unwrap();
    assert!(!h.halt.is_cascade_engaged());
    assert!(!h.halt.switch("lifecycle").is_engaged());
    // HALTED releases to CRITICAL, which still withholds new capital
    assert_eq!(h.coordinator.health_level(), HealthLevel::Critical);
    assert_eq!(h.coordinator.tier(), DegradationTier::T1);
    assert_eq!(h.audit_count(AuditRecordType::HaltReleased), 1);

    // a fresh interrupt token belongs to the next epoch
    assert!(!h.halt.interrupt_token().is_cancelled());
}
