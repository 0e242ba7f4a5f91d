//! Execution governance engine
//!
//! - [`position_book`]: the position lifecycle chokepoint (tier gating,
//!   stall timer, fill accounting)
//! - [`reconciliation`]: drift detection against broker truth
//! - [`runtime`]: wiring and thread ownership for the whole stack

pub mod position_book;
pub mod reconciliation;
pub mod runtime;

pub use position_book::{LifecycleConfig, PositionBook, EXIT_BREAKER, LIFECYCLE_COMPONENT, SUBMIT_BREAKER};
pub use reconciliation::{
    DriftSeverity, DriftType, ReconcileReport, ReconcileTrigger, Reconciler, RECONCILE_BREAKER,
    ReconciliationConfig, ReconciliationError, ReconciliationRecord, ReconciliationStats,
    Resolution,
};
pub use runtime::{PhoenixRuntime, RuntimeStatus, StepReport};
