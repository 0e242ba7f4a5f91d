//! Aggregate governance state
//!
//! Breaker, heartbeat and connection signals flow into the
//! [`GovernanceCoordinator`], which owns the health machine and derives the
//! capability tier. Consumers only ever see immutable
//! [`GovernanceSnapshot`]s.

pub mod coordinator;
pub mod degradation;
pub mod health;

pub use coordinator::{ConnectionSnapshot, GovernanceCoordinator, GovernanceSnapshot};
pub use degradation::{derive_tier, ConnectionView, DegradationConfig, DegradationTier, TierDecision, TierInputs};
pub use health::{HealthConfig, HealthError, HealthLevel, HealthMachine, HealthOutcome, HealthSnapshot};

use crate::core::errors::ErrorClass;
use crate::resilience::circuit_breaker::CircuitState;
use crate::resilience::supervisor::HeartbeatStatus;

/// Event delivered to the governance coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum GovernanceSignal {
    /// A circuit breaker changed state
    BreakerChanged {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// The supervisor's view of broker liveness changed
    Heartbeat(HeartbeatStatus),
    /// The brokerage connection is known to be gone
    ConnectionLost { reason: String },
    /// A reconnection passed identity/session re-validation
    ConnectionValidated { account_id: String, session_id: u64 },
    /// A classified failure observed at a call site
    Failure {
        source: String,
        class: ErrorClass,
        detail: String,
    },
    /// A fresh health check succeeded
    HealthCheckPassed,
}

/// Receiver of governance signals
pub trait SignalSink: Send + Sync {
    fn on_signal(&self, signal: GovernanceSignal);
}

/// Sink that drops every signal (standalone components, tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SignalSink for NullSink {
    fn on_signal(&self, _signal: GovernanceSignal) {}
}
