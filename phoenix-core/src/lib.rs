//! Phoenix Core - Resilience and execution governance for a trading platform
//!
//! Phoenix sits between an approval workflow and a brokerage connection and
//! decides, at every moment, how much capital authority the execution path
//! holds.
//!
//! ## Architecture
//! - **Circuit breakers** fail fast per component and feed one coordinator
//! - **Health state machine** escalates one level at a time, never recovers
//!   on time alone
//! - **Supervisor** on its own OS thread watches broker liveness and drives
//!   reconnection with capped exponential backoff
//! - **Degradation tiers** (T2 full, T1 exits only, T0 halted) derived purely
//!   from health, connection and halt state
//! - **Position lifecycle** of nine states behind a single chokepoint
//! - **Reconciliation** records drift against broker truth, never corrects it
//! - **Halt propagator** with lock-free per-component switches
//! - **Hash-chained audit log** for every state change
//!
//! ## Core Modules
//! - `core`: clock, ids, error taxonomy, position state table
//! - `resilience`: breaker, backoff, supervisor, halt, panic containment
//! - `governance`: health machine, tier derivation, coordinator
//! - `engine`: position book, reconciliation, runtime wiring
//! - `audit`: append-only hash chain with JSONL persistence
//! - `broker`: brokerage capability interface and fault-injecting double
//! - `monitoring`: alerts, Prometheus metrics, HTTP status surface
//! - `config`: TOML + environment configuration with validation

pub mod audit;
pub mod broker;
pub mod config;
pub mod core;
pub mod engine;
pub mod governance;
pub mod monitoring;
pub mod resilience;
pub mod testing;
pub mod utils;

pub use crate::core::{
    CancelToken, Clock, ErrorClass, ManualClock, Position, PositionId, PositionState, Side,
    SystemClock,
};
pub use crate::config::PhoenixConfig;
pub use engine::{PhoenixRuntime, RuntimeStatus};
pub use governance::{DegradationTier, GovernanceCoordinator, HealthLevel};

pub use anyhow::{Error, Result};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::audit::{AuditLog, AuditQuery, AuditRecordType};
    pub use crate::broker::{Brokerage, FaultProfile, SimulatedBroker};
    pub use crate::core::{Clock, ErrorClass, ManualClock, PositionId, PositionState, Side, SystemClock};
    pub use crate::engine::{PhoenixRuntime, PositionBook, Reconciler};
    pub use crate::governance::{DegradationTier, GovernanceCoordinator, HealthLevel};
    pub use crate::resilience::{CircuitBreaker, CircuitState, HaltMode};
    pub use crate::{Error, Result};
}
