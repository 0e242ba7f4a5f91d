//! Capability tiers
//!
//! The tier is never set directly. [`derive_tier`] computes it from the health
//! level, the connection view and the time since disconnect, and the
//! coordinator re-derives it on every signal and every read.

use super::health::HealthLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Capital authority granted to the execution path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DegradationTier {
    /// Halted
    T0 = 0,
    /// Monitoring only; exits still allowed
    T1 = 1,
    /// Full capital authority
    T2 = 2,
}

impl DegradationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationTier::T0 => "T0",
            DegradationTier::T1 => "T1",
            DegradationTier::T2 => "T2",
        }
    }

    pub fn allows_capital(&self) -> bool {
        *self == DegradationTier::T2
    }
}

impl fmt::Display for DegradationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DegradationConfig {
    /// Hard bound on revoking T2 after a disconnect
    pub revoke_within: Duration,
    /// Unresolved disconnect that drops the tier to T0
    pub halt_after: Duration,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            revoke_within: Duration::from_secs(1),
            halt_after: Duration::from_secs(60),
        }
    }
}

/// Connection as seen by the tier derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionView {
    /// Connected and re-validated
    Validated,
    /// Lost, or reconnected but not yet re-validated
    Unvalidated { since: Instant },
}

impl ConnectionView {
    pub fn is_validated(&self) -> bool {
        matches!(self, ConnectionView::Validated)
    }

    pub fn unvalidated_for(&self, now: Instant) -> Option<Duration> {
        match self {
            ConnectionView::Validated => None,
            ConnectionView::Unvalidated { since } => Some(now.saturating_duration_since(*since)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TierInputs {
    pub health: HealthLevel,
    pub connection: ConnectionView,
    pub halt_engaged: bool,
    pub now: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierDecision {
    pub tier: DegradationTier,
    pub reason: String,
    /// T0 was reached because the disconnect outlived `halt_after`
    pub disconnect_timeout: bool,
}

impl TierDecision {
    fn new(tier: DegradationTier, reason: impl Into<String>) -> Self {
        Self {
            tier,
            reason: reason.into(),
            disconnect_timeout: false,
        }
    }
}

/// Derive the capability tier
pub fn derive_tier(inputs: &TierInputs, config: &DegradationConfig) -> TierDecision {
    if inputs.halt_engaged {
        return TierDecision::new(DegradationTier::T0, "halt engaged");
    }
    if inputs.health == HealthLevel::Halted {
        return TierDecision::new(DegradationTier::T0, "health HALTED");
    }
    if let Some(down_for) = inputs.connection.unvalidated_for(inputs.now) {
        if down_for >= config.halt_after {
            return TierDecision {
                tier: DegradationTier::T0,
                reason: format!(
                    "connection unvalidated for {}ms (limit {}ms)",
                    down_for.as_millis(),
                    config.halt_after.as_millis()
                ),
                disconnect_timeout: true,
            };
        }
        return TierDecision::new(
            DegradationTier::T1,
            format!("connection unvalidated for {}ms", down_for.as_millis()),
        );
    }
    match inputs.health {
        HealthLevel::Critical | HealthLevel::Degraded => {
            TierDecision::new(DegradationTier::T1, format!("health {}", inputs.health))
        }
        _ => TierDecision::new(DegradationTier::T2, "healthy and validated"),
    }
}
