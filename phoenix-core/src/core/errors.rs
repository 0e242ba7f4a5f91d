//! Error taxonomy for governance-layer operations
//!
//! Every failure is classified at its call site into one of four classes
//! (see [`ErrorClass`]); the class decides whether the failure is retried,
//! degrades the tier, raises an alert, or triggers the halt cascade.

use super::position_fsm::PositionState;
use super::types::PositionId;
use crate::governance::DegradationTier;
use crate::resilience::HaltMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a failure propagates through the governance layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Retry via backoff
    Transient,
    /// Reduce capability tier, keep running
    Degraded,
    /// Alert and restrict further capability
    Critical,
    /// Triggers the halt cascade
    Fatal,
}

/// Errors surfaced by a brokerage backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker connection lost")]
    Disconnected,

    #[error("broker call timed out after {0}ms")]
    Timeout(u64),

    #[error("broker rate limited the request")]
    RateLimited,

    #[error("order rejected by broker: {0}")]
    Rejected(String),

    #[error("session not authorized: {0}")]
    Unauthorized(String),

    #[error("unknown broker order reference {0}")]
    UnknownOrder(String),

    #[error("broker internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Classify this failure for propagation
    pub fn class(&self) -> ErrorClass {
        match self {
            BrokerError::Timeout(_) | BrokerError::RateLimited => ErrorClass::Transient,
            BrokerError::Disconnected | BrokerError::Internal(_) => ErrorClass::Degraded,
            BrokerError::Rejected(_) | BrokerError::UnknownOrder(_) => ErrorClass::Transient,
            BrokerError::Unauthorized(_) => ErrorClass::Critical,
        }
    }

    /// Whether this failure means the connection itself is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BrokerError::Disconnected)
    }

    /// Whether this failure should count against the protecting circuit breaker
    ///
    /// A business rejection is a healthy answer from a live broker.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, BrokerError::Rejected(_) | BrokerError::UnknownOrder(_))
    }
}

/// A transition not present in the declared lifecycle table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transition {from} -> {to} is not declared")]
pub struct TransitionError {
    pub from: PositionState,
    pub to: PositionState,
}

/// Errors from the position lifecycle book
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    #[error("unknown position {0}")]
    UnknownPosition(PositionId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("capital-committing action refused at tier {0}")]
    TierGated(DegradationTier),

    #[error("action refused while halted ({0:?})")]
    Halted(HaltMode),

    #[error("circuit breaker {0} is open")]
    BreakerOpen(String),

    #[error("quantity must be positive")]
    InvalidQuantity,

    #[error("exit order {order_ref} already working on {id}")]
    ExitPending { id: PositionId, order_ref: String },

    #[error("fill of {fill} exceeds remaining {remaining} on {id}")]
    Overfill {
        id: PositionId,
        fill: rust_decimal::Decimal,
        remaining: rust_decimal::Decimal,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl LifecycleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LifecycleError::Broker(e) => e.class(),
            LifecycleError::Halted(_) => ErrorClass::Critical,
            LifecycleError::TierGated(_) | LifecycleError::BreakerOpen(_) => ErrorClass::Degraded,
            _ => ErrorClass::Transient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_classification() {
        assert_eq!(BrokerError::Timeout(500).class(), ErrorClass::Transient);
        assert_eq!(BrokerError::Disconnected.class(), ErrorClass::Degraded);
        assert_eq!(
            BrokerError::Unauthorized("session expired".into()).class(),
            ErrorClass::Critical
        );
        assert!(BrokerError::Disconnected.is_disconnect());
        assert!(!BrokerError::Rejected("margin".into()).counts_as_failure());
        assert!(BrokerError::Internal("500".into()).counts_as_failure());
    }

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError {
            from: PositionState::Closed,
            to: PositionState::Submitted,
        };
        assert_eq!(err.to_string(), "transition CLOSED -> SUBMITTED is not declared");
    }

    #[test]
    fn test_lifecycle_error_wraps_broker() {
        let err: LifecycleError = BrokerError::Disconnected.into();
        assert_eq!(err.class(), ErrorClass::Degraded);
        assert!(err.to_string().contains("connection lost"));
    }
}
