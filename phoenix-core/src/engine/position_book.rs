//! Position lifecycle book
//!
//! The book is the only place position state changes. Every attempted
//! transition, valid or not, produces exactly one audit record
//! (`POSITION_TRANSITION` or `POSITION_TRANSITION_REJECTED`).
//!
//! Gating:
//! - APPROVED → SUBMITTED commits capital: refused unless the tier is T2 and
//!   the lifecycle halt switch permits it, and protected by the
//!   `broker.submit` breaker
//! - exits and cancellations are never tier gated; a declared FREEZE halt
//!   blocks them
//! - broker-originated facts (ack, fill, reject, stall) are always recorded
//!
//! Terminal positions move to the archive; nothing is ever deleted.

use crate::audit::{AuditLog, AuditRecordType};
use crate::broker::{BrokerEvent, Brokerage, FillEvent, OrderRequest};
use crate::core::clock::Clock;
use crate::core::errors::{BrokerError, LifecycleError, TransitionError};
use crate::core::position_fsm::{action_kind, is_declared, Position, PositionState};
use crate::core::types::{PositionId, Side};
use crate::governance::{DegradationTier, GovernanceCoordinator};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::resilience::halt::HaltSwitch;
use crate::resilience::supervisor::Supervisor;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Breaker guarding new submissions
pub const SUBMIT_BREAKER: &str = "broker.submit";
/// Breaker guarding exit and cancel calls
pub const EXIT_BREAKER: &str = "broker.exit";
/// Halt switch component name
pub const LIFECYCLE_COMPONENT: &str = "lifecycle";

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    /// SUBMITTED without acknowledgment for this long becomes STALLED
    pub ack_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Serialize)]
struct TransitionRecord<'a> {
    position: PositionId,
    symbol: &'a str,
    from: Option<PositionState>,
    to: PositionState,
    cause: &'a str,
}

#[derive(Serialize)]
struct RejectedRecord<'a> {
    position: PositionId,
    from: Option<PositionState>,
    to: PositionState,
    cause: &'a str,
    reason: String,
}

#[derive(Serialize)]
struct FillRecord<'a> {
    position: PositionId,
    broker_order_ref: &'a str,
    quantity: Decimal,
    price: Decimal,
    filled_quantity: Decimal,
    remaining_quantity: Decimal,
}

#[derive(Default)]
struct BookInner {
    positions: BTreeMap<PositionId, Position>,
    archive: Vec<Position>,
    by_order_ref: HashMap<String, PositionId>,
    next_id: u64,
}

impl BookInner {
    fn lookup(&self, id: PositionId) -> Option<&Position> {
        self.positions
            .get(&id)
            .or_else(|| self.archive.iter().find(|p| p.id == id))
    }

    fn is_exit(&self, id: PositionId, order_ref: &str) -> bool {
        self.positions
            .get(&id)
            .map_or(false, |p| p.exit_order_ref.as_deref() == Some(order_ref))
    }

    /// Forget a dead exit order so the position can be closed again
    fn release_exit(&mut self, id: PositionId) {
        if let Some(order_ref) = self.positions.get_mut(&id).and_then(|p| p.exit_order_ref.take()) {
            self.by_order_ref.remove(&order_ref);
        }
    }
}

/// Position lifecycle chokepoint
pub struct PositionBook {
    config: RwLock<LifecycleConfig>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    coordinator: Arc<GovernanceCoordinator>,
    broker: Arc<dyn Brokerage>,
    submit_breaker: Arc<CircuitBreaker>,
    exit_breaker: Arc<CircuitBreaker>,
    halt: Arc<HaltSwitch>,
    supervisor: RwLock<Option<Arc<Supervisor>>>,
    inner: Mutex<BookInner>,
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PositionBook")
            .field("live", &inner.positions.len())
            .field("archived", &inner.archive.len())
            .finish()
    }
}

impl PositionBook {
    pub fn new(
        config: LifecycleConfig,
        breaker_config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        coordinator: Arc<GovernanceCoordinator>,
        broker: Arc<dyn Brokerage>,
    ) -> Self {
        let submit_breaker = coordinator.register_breaker(SUBMIT_BREAKER, breaker_config.clone());
        let exit_breaker = coordinator.register_breaker(EXIT_BREAKER, breaker_config);
        let halt = coordinator.halt().switch(LIFECYCLE_COMPONENT);
        Self {
            config: RwLock::new(config),
            clock,
            audit,
            coordinator,
            broker,
            submit_breaker,
            exit_breaker,
            halt,
            supervisor: RwLock::new(None),
            inner: Mutex::new(BookInner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Route call-site disconnects to the supervisor as well
    pub fn attach_supervisor(&self, supervisor: Arc<Supervisor>) {
        *self.supervisor.write() = Some(supervisor);
    }

    pub fn set_config(&self, config: LifecycleConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> LifecycleConfig {
        self.config.read().clone()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Create a position in PROPOSED
    pub fn propose(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<PositionId, LifecycleError> {
        if quantity <= Decimal::ZERO || limit_price.map_or(false, |p| p <= Decimal::ZERO) {
            return Err(LifecycleError::InvalidQuantity);
        }
        let mut inner = self.inner.lock();
        let id = PositionId(inner.next_id);
        inner.next_id += 1;
        let position = Position::new(id, symbol, side, quantity, limit_price);
        info!("{} proposed: {} {} {}", id, side, quantity, symbol);
        self.audit.record(
            AuditRecordType::PositionTransition,
            LIFECYCLE_COMPONENT,
            &TransitionRecord {
                position: id,
                symbol,
                from: None,
                to: PositionState::Proposed,
                cause: "proposed",
            },
        );
        inner.positions.insert(id, position);
        Ok(id)
    }

    pub fn approve(&self, id: PositionId, cause: &str) -> Result<(), LifecycleError> {
        self.attempt_transition(id, PositionState::Approved, cause)
    }

    /// Route one requested transition through the gates
    pub fn attempt_transition(
        &self,
        id: PositionId,
        to: PositionState,
        cause: &str,
    ) -> Result<(), LifecycleError> {
        let from = self.inner.lock().lookup(id).map(|p| p.state);
        let Some(from) = from else {
            self.reject(id, None, to, cause, "unknown position");
            return Err(LifecycleError::UnknownPosition(id));
        };
        if !is_declared(from, to) {
            return self.transition(&mut self.inner.lock(), id, to, cause);
        }
        match (from, to) {
            (PositionState::Approved, PositionState::Submitted) => self.submit(id),
            (PositionState::Managed, PositionState::Closed) => self.close(id, cause),
            (_, PositionState::Cancelled) => self.cancel(id, cause),
            _ => {
                let mut inner = self.inner.lock();
                self.check_halt(id, from, to, cause)?;
                self.transition(&mut inner, id, to, cause)
            }
        }
    }

    /// APPROVED → SUBMITTED: the only capital-committing transition
    pub fn submit(&self, id: PositionId) -> Result<(), LifecycleError> {
        let cause = "submit";
        let mut inner = self.inner.lock();
        let Some(position) = inner.positions.get(&id) else {
            drop(inner);
            self.reject(id, None, PositionState::Submitted, cause, "unknown position");
            return Err(LifecycleError::UnknownPosition(id));
        };
        let from = position.state;
        if from != PositionState::Approved {
            return self.transition(&mut inner, id, PositionState::Submitted, cause);
        }

        let tier = self.coordinator.tier();
        if tier != DegradationTier::T2 {
            self.reject(id, Some(from), PositionState::Submitted, cause, &format!("tier {tier}"));
            return Err(LifecycleError::TierGated(tier));
        }
        self.check_halt(id, from, PositionState::Submitted, cause)?;
        if !self.submit_breaker.allow_request() {
            self.reject(
                id,
                Some(from),
                PositionState::Submitted,
                cause,
                &format!("breaker {SUBMIT_BREAKER} open"),
            );
            return Err(LifecycleError::BreakerOpen(SUBMIT_BREAKER.to_string()));
        }

        let request = OrderRequest {
            client_ref: id.to_string(),
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.requested_quantity,
            limit_price: position.limit_price,
            reduce_only: false,
        };
        match self.broker.submit_order(&request) {
            Ok(ack) => {
                self.submit_breaker.record_success();
                if let Some(position) = inner.positions.get_mut(&id) {
                    position.broker_order_ref = Some(ack.broker_order_ref.clone());
                    position.acknowledged = ack.acknowledged;
                    position.submitted_at = Some(self.clock.now());
                }
                inner.by_order_ref.insert(ack.broker_order_ref.clone(), id);
                let cause = format!("order {} submitted", ack.broker_order_ref);
                self.transition(&mut inner, id, PositionState::Submitted, &cause)
            }
            Err(BrokerError::Rejected(reason)) => {
                // the order reached the broker and was refused there
                self.submit_breaker.record_success();
                self.transition(&mut inner, id, PositionState::Submitted, "order submitted")?;
                self.transition(
                    &mut inner,
                    id,
                    PositionState::Rejected,
                    &format!("broker rejected: {reason}"),
                )?;
                Err(BrokerError::Rejected(reason).into())
            }
            Err(e) => {
                drop(inner);
                self.on_broker_error(&self.submit_breaker, SUBMIT_BREAKER, &e);
                self.reject(id, Some(from), PositionState::Submitted, cause, &e.to_string());
                Err(e.into())
            }
        }
    }

    /// Send the reduce-only exit order for a MANAGED position
    ///
    /// The position stays MANAGED with `exit_order_ref` set; it moves to
    /// CLOSED once exit fills cover `filled_quantity`.
    pub fn close(&self, id: PositionId, cause: &str) -> Result<(), LifecycleError> {
        let mut inner = self.inner.lock();
        let Some(position) = inner.positions.get(&id) else {
            drop(inner);
            self.reject(id, None, PositionState::Closed, cause, "unknown position");
            return Err(LifecycleError::UnknownPosition(id));
        };
        let from = position.state;
        if from != PositionState::Managed {
            return self.transition(&mut inner, id, PositionState::Closed, cause);
        }
        if let Some(order_ref) = position.exit_order_ref.clone() {
            self.reject(id, Some(from), PositionState::Closed, cause, &format!("exit order {order_ref} working"));
            return Err(LifecycleError::ExitPending { id, order_ref });
        }
        self.check_halt(id, from, PositionState::Closed, cause)?;
        if !self.exit_breaker.allow_request() {
            self.reject(id, Some(from), PositionState::Closed, cause, &format!("breaker {EXIT_BREAKER} open"));
            return Err(LifecycleError::BreakerOpen(EXIT_BREAKER.to_string()));
        }
        let request = OrderRequest {
            client_ref: format!("{id}-exit"),
            symbol: position.symbol.clone(),
            side: position.side.opposite(),
            quantity: position.filled_quantity,
            limit_price: None,
            reduce_only: true,
        };
        match self.broker.submit_order(&request) {
            Ok(ack) => {
                self.exit_breaker.record_success();
                if let Some(position) = inner.positions.get_mut(&id) {
                    position.exit_order_ref = Some(ack.broker_order_ref.clone());
                    position.exit_filled_quantity = Decimal::ZERO;
                }
                inner.by_order_ref.insert(ack.broker_order_ref.clone(), id);
                info!("{} exit order {} working ({})", id, ack.broker_order_ref, cause);
                Ok(())
            }
            Err(e) => {
                drop(inner);
                self.on_broker_error(&self.exit_breaker, EXIT_BREAKER, &e);
                self.reject(id, Some(from), PositionState::Closed, cause, &e.to_string());
                Err(e.into())
            }
        }
    }

    /// → CANCELLED from PROPOSED, APPROVED or STALLED
    pub fn cancel(&self, id: PositionId, cause: &str) -> Result<(), LifecycleError> {
        let mut inner = self.inner.lock();
        let Some(position) = inner.positions.get(&id) else {
            drop(inner);
            self.reject(id, None, PositionState::Cancelled, cause, "unknown position");
            return Err(LifecycleError::UnknownPosition(id));
        };
        let from = position.state;
        if !is_declared(from, PositionState::Cancelled) {
            return self.transition(&mut inner, id, PositionState::Cancelled, cause);
        }
        self.check_halt(id, from, PositionState::Cancelled, cause)?;

        if from == PositionState::Stalled {
            if let Some(order_ref) = position.broker_order_ref.clone() {
                if !self.exit_breaker.allow_request() {
                    self.reject(id, Some(from), PositionState::Cancelled, cause, &format!("breaker {EXIT_BREAKER} open"));
                    return Err(LifecycleError::BreakerOpen(EXIT_BREAKER.to_string()));
                }
                if let Err(e) = self.broker.cancel_order(&order_ref) {
                    drop(inner);
                    self.on_broker_error(&self.exit_breaker, EXIT_BREAKER, &e);
                    self.reject(id, Some(from), PositionState::Cancelled, cause, &e.to_string());
                    return Err(e.into());
                }
                self.exit_breaker.record_success();
            }
        }
        self.transition(&mut inner, id, PositionState::Cancelled, cause)
    }

    /// Apply one broker event; returns the affected position
    pub fn on_event(&self, event: &BrokerEvent) -> Result<Option<PositionId>, LifecycleError> {
        let mut inner = self.inner.lock();
        let Some(&id) = inner.by_order_ref.get(event.broker_order_ref()) else {
            debug!("Broker event for unknown order {}", event.broker_order_ref());
            return Ok(None);
        };
        match event {
            BrokerEvent::Acknowledged { .. } => {
                if let Some(position) = inner.positions.get_mut(&id) {
                    position.acknowledged = true;
                    debug!("{} acknowledged", id);
                }
            }
            BrokerEvent::Fill(fill) => self.apply_fill(&mut inner, id, fill)?,
            BrokerEvent::Rejected { broker_order_ref, reason } if inner.is_exit(id, broker_order_ref) => {
                warn!("{} exit order {} rejected: {}", id, broker_order_ref, reason);
                inner.release_exit(id);
            }
            BrokerEvent::Cancelled { broker_order_ref } if inner.is_exit(id, broker_order_ref) => {
                warn!("{} exit order {} cancelled", id, broker_order_ref);
                inner.release_exit(id);
            }
            BrokerEvent::Rejected { reason, .. } => {
                self.transition(&mut inner, id, PositionState::Rejected, &format!("broker rejected: {reason}"))?;
            }
            BrokerEvent::Cancelled { .. } => {
                let state = inner.positions.get(&id).map(|p| p.state);
                // our own cancel already moved the position; only broker-initiated ones remain
                if state.is_some() {
                    self.transition(&mut inner, id, PositionState::Cancelled, "broker cancelled")?;
                }
            }
        }
        Ok(Some(id))
    }

    fn apply_fill(&self, inner: &mut BookInner, id: PositionId, fill: &FillEvent) -> Result<(), LifecycleError> {
        let Some(position) = inner.positions.get_mut(&id) else {
            return Ok(());
        };
        if position.exit_order_ref.as_deref() == Some(fill.broker_order_ref.as_str()) {
            return self.apply_exit_fill(inner, id, fill);
        }
        if !matches!(position.state, PositionState::Submitted | PositionState::Stalled) {
            warn!("{} fill in state {} ignored", id, position.state);
            return Ok(());
        }
        let remaining = position.remaining_quantity();
        if fill.quantity > remaining {
            return Err(LifecycleError::Overfill {
                id,
                fill: fill.quantity,
                remaining,
            });
        }
        position.add_fill(fill.quantity, fill.price);
        position.acknowledged = true;
        self.audit.record(
            AuditRecordType::PositionFill,
            LIFECYCLE_COMPONENT,
            &FillRecord {
                position: id,
                broker_order_ref: &fill.broker_order_ref,
                quantity: fill.quantity,
                price: fill.price,
                filled_quantity: position.filled_quantity,
                remaining_quantity: position.remaining_quantity(),
            },
        );
        if position.is_fully_filled() {
            self.transition(inner, id, PositionState::Filled, "fully filled")?;
            self.transition(inner, id, PositionState::Managed, "under management")?;
        }
        Ok(())
    }

    fn apply_exit_fill(&self, inner: &mut BookInner, id: PositionId, fill: &FillEvent) -> Result<(), LifecycleError> {
        let Some(position) = inner.positions.get_mut(&id) else {
            return Ok(());
        };
        let remaining = position.filled_quantity - position.exit_filled_quantity;
        if fill.quantity > remaining {
            return Err(LifecycleError::Overfill {
                id,
                fill: fill.quantity,
                remaining,
            });
        }
        position.exit_filled_quantity += fill.quantity;
        debug!("{} exit fill {} @ {}", id, fill.quantity, fill.price);
        self.audit.record(
            AuditRecordType::PositionFill,
            LIFECYCLE_COMPONENT,
            &FillRecord {
                position: id,
                broker_order_ref: &fill.broker_order_ref,
                quantity: fill.quantity,
                price: fill.price,
                filled_quantity: position.exit_filled_quantity,
                remaining_quantity: position.filled_quantity - position.exit_filled_quantity,
            },
        );
        if position.exit_filled_quantity >= position.filled_quantity {
            let cause = format!("exit order {} filled", fill.broker_order_ref);
            self.transition(inner, id, PositionState::Closed, &cause)?;
        }
        Ok(())
    }

    /// SUBMITTED without ack past `ack_timeout` → STALLED
    pub fn check_stalls(&self) -> Vec<PositionId> {
        let timeout = self.config.read().ack_timeout;
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let due: Vec<PositionId> = inner
            .positions
            .values()
            .filter(|p| p.state == PositionState::Submitted && !p.acknowledged)
            .filter(|p| p.submitted_at.map_or(false, |at| now.saturating_duration_since(at) >= timeout))
            .map(|p| p.id)
            .collect();
        for &id in &due {
            warn!("{} unacknowledged for {:?}: stalled", id, timeout);
            if let Err(e) = self.transition(&mut inner, id, PositionState::Stalled, "ack_timeout") {
                warn!("Stall transition for {} failed: {}", id, e);
            }
        }
        due
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, id: PositionId) -> Option<Position> {
        self.inner.lock().lookup(id).cloned()
    }

    /// Live (non-archived) positions
    pub fn positions(&self) -> Vec<Position> {
        self.inner.lock().positions.values().cloned().collect()
    }

    /// SUBMITTED, STALLED, FILLED or MANAGED
    pub fn open_positions(&self) -> Vec<Position> {
        self.inner
            .lock()
            .positions
            .values()
            .filter(|p| p.state.is_open())
            .cloned()
            .collect()
    }

    pub fn archive(&self) -> Vec<Position> {
        self.inner.lock().archive.clone()
    }

    /// Count per state across live and archived positions
    pub fn counts_by_state(&self) -> BTreeMap<PositionState, usize> {
        let inner = self.inner.lock();
        let mut counts = BTreeMap::new();
        for p in inner.positions.values().chain(inner.archive.iter()) {
            *counts.entry(p.state).or_insert(0) += 1;
        }
        counts
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Validate, apply and audit one transition under the book lock
    fn transition(
        &self,
        inner: &mut BookInner,
        id: PositionId,
        to: PositionState,
        cause: &str,
    ) -> Result<(), LifecycleError> {
        let at_ms = self.clock.wall_millis();
        let Some(position) = inner.positions.get_mut(&id) else {
            let from = inner.lookup(id).map(|p| p.state);
            self.reject(id, from, to, cause, "position archived or unknown");
            return match from {
                Some(from) => Err(TransitionError { from, to }.into()),
                None => Err(LifecycleError::UnknownPosition(id)),
            };
        };
        let from = position.state;
        if let Err(e) = position.apply(to, at_ms, cause) {
            self.reject(id, Some(from), to, cause, &e.to_string());
            return Err(e.into());
        }
        info!("{} {} -> {} ({})", id, from, to, cause);
        self.audit.record(
            AuditRecordType::PositionTransition,
            LIFECYCLE_COMPONENT,
            &TransitionRecord {
                position: id,
                symbol: &position.symbol,
                from: Some(from),
                to,
                cause,
            },
        );
        if to.is_terminal() {
            if let Some(done) = inner.positions.remove(&id) {
                for order_ref in done.broker_order_ref.iter().chain(done.exit_order_ref.iter()) {
                    inner.by_order_ref.remove(order_ref);
                }
                inner.archive.push(done);
            }
        }
        Ok(())
    }

    fn check_halt(
        &self,
        id: PositionId,
        from: PositionState,
        to: PositionState,
        cause: &str,
    ) -> Result<(), LifecycleError> {
        if let Err(mode) = self.halt.check(action_kind(from, to)) {
            self.reject(id, Some(from), to, cause, &format!("halted ({mode})"));
            return Err(LifecycleError::Halted(mode));
        }
        Ok(())
    }

    fn reject(&self, id: PositionId, from: Option<PositionState>, to: PositionState, cause: &str, reason: &str) {
        debug!("{} transition to {} refused: {}", id, to, reason);
        self.audit.record(
            AuditRecordType::PositionTransitionRejected,
            LIFECYCLE_COMPONENT,
            &RejectedRecord {
                position: id,
                from,
                to,
                cause,
                reason: reason.to_string(),
            },
        );
    }

    fn on_broker_error(&self, breaker: &CircuitBreaker, source: &str, error: &BrokerError) {
        if error.counts_as_failure() {
            breaker.record_failure();
            self.coordinator.report_failure(source, error.class(), &error.to_string());
        } else {
            breaker.record_success();
        }
        if error.is_disconnect() {
            self.coordinator.report_connection_lost(&format!("{source}: {error}"));
            if let Some(supervisor) = self.supervisor.read().as_ref() {
                supervisor.report_disconnect(&format!("{source}: {error}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::broker::{FaultProfile, SimulatedBroker};
    use crate::core::clock::ManualClock;
    use crate::governance::{DegradationConfig, HealthConfig};
    use crate::monitoring::alerts::{AlertConfig, AlertDispatcher};
    use crate::resilience::halt::{HaltConfig, HaltMode, HaltPropagator};
    use rust_decimal_macros::dec;

    struct Fixture {
        clock: Arc<ManualClock>,
        audit: Arc<AuditLog>,
        broker: Arc<SimulatedBroker>,
        coordinator: Arc<GovernanceCoordinator>,
        book: PositionBook,
    }

    fn fixture(profile: FaultProfile) -> Fixture {
        let clock = ManualClock::shared();
        let audit = Arc::new(AuditLog::in_memory(clock.clone()));
        let alerts = Arc::new(AlertDispatcher::new(AlertConfig::default(), clock.clone(), vec![]));
        let halt = Arc::new(HaltPropagator::new(HaltConfig::default(), clock.clone(), audit.clone()));
        let coordinator = GovernanceCoordinator::new(
            HealthConfig::default(),
            DegradationConfig::default(),
            clock.clone(),
            audit.clone(),
            alerts,
            halt,
        );
        let broker = Arc::new(SimulatedBroker::new("ACC-1", profile, clock.clone()));
        broker.connect().unwrap();
        coordinator.report_connection_validated("ACC-1", 1);
        let book = PositionBook::new(
            LifecycleConfig::default(),
            CircuitBreakerConfig::default(),
            clock.clone(),
            audit.clone(),
            coordinator.clone(),
            broker.clone(),
        );
        Fixture {
            clock,
            audit,
            broker,
            coordinator,
            book,
        }
    }

    fn approved(f: &Fixture) -> PositionId {
        let id = f.book.propose("ES", Side::Buy, dec!(2), Some(dec!(100))).unwrap();
        f.book.approve(id, "risk ok").unwrap();
        id
    }

    fn drain(f: &Fixture, rx: &crossbeam::channel::Receiver<BrokerEvent>) {
        while let Ok(event) = rx.try_recv() {
            f.book.on_event(&event).unwrap();
        }
    }

    #[test]
    fn test_full_lifecycle_to_closed() {
        let f = fixture(FaultProfile::perfect());
        let rx = f.broker.subscribe_fills().unwrap();
        let id = approved(&f);
        f.book.submit(id).unwrap();
        drain(&f, &rx);
        assert_eq!(f.book.get(id).unwrap().state, PositionState::Managed);

        f.book.close(id, "target reached").unwrap();
        drain(&f, &rx);
        let archived = f.book.archive();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].state, PositionState::Closed);
        assert_eq!(archived[0].history.len(), 5);
        assert!(f.book.positions().is_empty());
        assert!(f.book.inner.lock().by_order_ref.is_empty());
    }

    #[test]
    fn test_close_waits_for_exit_fills() {
        let f = fixture(FaultProfile {
            fill_probability: 0.0,
            ..FaultProfile::perfect()
        });
        let rx = f.broker.subscribe_fills().unwrap();
        let id = approved(&f);
        f.book.submit(id).unwrap();
        let entry = f.book.get(id).unwrap().broker_order_ref.unwrap();
        f.broker.emit_fill(&entry, dec!(2), dec!(100));
        drain(&f, &rx);

        f.book.close(id, "target reached").unwrap();
        let p = f.book.get(id).unwrap();
        assert_eq!(p.state, PositionState::Managed);
        let exit = p.exit_order_ref.unwrap();
        assert!(matches!(
            f.book.close(id, "target reached"),
            Err(LifecycleError::ExitPending { .. })
        ));
        assert_eq!(f.broker.submitted_count(), 2);

        f.broker.emit_fill(&exit, dec!(1.5), dec!(101));
        drain(&f, &rx);
        let p = f.book.get(id).unwrap();
        assert_eq!(p.state, PositionState::Managed);
        assert_eq!(p.exit_filled_quantity, dec!(1.5));

        f.broker.emit_fill(&exit, dec!(0.5), dec!(101));
        drain(&f, &rx);
        let p = f.book.get(id).unwrap();
        assert_eq!(p.state, PositionState::Closed);
        assert_eq!(p.history.last().unwrap().cause, format!("exit order {exit} filled"));
        assert_eq!(f.audit.count(&AuditQuery::of_type(AuditRecordType::PositionFill)), 3);
    }

    #[test]
    fn test_unanswered_exit_keeps_position_managed() {
        let f = fixture(FaultProfile::silent());
        let rx = f.broker.subscribe_fills().unwrap();
        let id = approved(&f);
        f.book.submit(id).unwrap();
        let entry = f.book.get(id).unwrap().broker_order_ref.unwrap();
        f.broker.emit_fill(&entry, dec!(2), dec!(100));
        drain(&f, &rx);
        assert_eq!(f.book.get(id).unwrap().state, PositionState::Managed);

        f.book.close(id, "flatten").unwrap();
        drain(&f, &rx);
        let p = f.book.get(id).unwrap();
        assert_eq!(p.state, PositionState::Managed);
        assert!(p.exit_order_ref.is_some());
        assert_eq!(p.signed_exposure(), dec!(2));
        assert!(f.book.archive().is_empty());
    }

    #[test]
    fn test_partial_fills_accumulate() {
        let f = fixture(FaultProfile {
            fill_probability: 0.0,
            ..FaultProfile::perfect()
        });
        let id = approved(&f);
        f.book.submit(id).unwrap();
        let order_ref = f.book.get(id).unwrap().broker_order_ref.unwrap();

        let fill = |qty, px| BrokerEvent::Fill(FillEvent {
            broker_order_ref: order_ref.clone(),
            quantity: qty,
            price: px,
            timestamp_ms: 0,
        });
        f.book.on_event(&fill(dec!(0.5), dec!(100))).unwrap();
        assert_eq!(f.book.get(id).unwrap().state, PositionState::Submitted);
        f.book.on_event(&fill(dec!(1.5), dec!(104))).unwrap();

        let p = f.book.get(id).unwrap();
        assert_eq!(p.state, PositionState::Managed);
        assert_eq!(p.filled_quantity, dec!(2));
        assert_eq!(p.avg_fill_price, Some(dec!(103)));
        assert_eq!(f.audit.count(&AuditQuery::of_type(AuditRecordType::PositionFill)), 2);

        assert!(matches!(
            f.book.on_event(&fill(dec!(1), dec!(100))),
            Ok(Some(_))
        ));
    }

    #[test]
    fn test_submit_refused_below_t2() {
        let f = fixture(FaultProfile::perfect());
        let id = approved(&f);
        f.coordinator.report_connection_lost("socket closed");
        assert_eq!(f.book.submit(id), Err(LifecycleError::TierGated(DegradationTier::T1)));
        assert_eq!(f.broker.submitted_count(), 0);
        assert_eq!(f.book.get(id).unwrap().state, PositionState::Approved);
        assert_eq!(
            f.audit.count(&AuditQuery::of_type(AuditRecordType::PositionTransitionRejected)),
            1
        );
    }

    #[test]
    fn test_exits_allowed_below_t2_but_not_under_freeze() {
        let f = fixture(FaultProfile::perfect());
        let rx = f.broker.subscribe_fills().unwrap();
        let a = approved(&f);
        let b = approved(&f);
        f.book.submit(a).unwrap();
        f.book.submit(b).unwrap();
        drain(&f, &rx);

        f.coordinator.operator_halt(HaltMode::ExitOnly, "drill", "ops");
        f.book.close(a, "flatten").unwrap();

        f.coordinator.operator_release("ops").unwrap();
        f.coordinator.operator_halt(HaltMode::Freeze, "drill", "ops");
        assert_eq!(f.book.close(b, "flatten"), Err(LifecycleError::Halted(HaltMode::Freeze)));
        assert_eq!(f.book.get(b).unwrap().state, PositionState::Managed);
    }

    #[test]
    fn test_stall_exactly_once_at_timeout() {
        let f = fixture(FaultProfile::silent());
        let id = approved(&f);
        f.book.submit(id).unwrap();

        f.clock.advance(Duration::from_secs(59));
        assert!(f.book.check_stalls().is_empty());
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.book.check_stalls(), vec![id]);
        f.clock.advance(Duration::from_secs(120));
        assert!(f.book.check_stalls().is_empty());

        let stalls: Vec<_> = f
            .audit
            .query(&AuditQuery::of_type(AuditRecordType::PositionTransition))
            .into_iter()
            .filter(|r| r.payload["to"] == "STALLED")
            .collect();
        assert_eq!(stalls.len(), 1);
        assert_eq!(stalls[0].payload["cause"], "ack_timeout");

        f.book.cancel(id, "stalled order withdrawn").unwrap();
        assert_eq!(f.book.get(id).unwrap().state, PositionState::Cancelled);
        assert!(f.book.inner.lock().by_order_ref.is_empty());
    }

    #[test]
    fn test_undeclared_transition_is_audited_and_refused() {
        let f = fixture(FaultProfile::perfect());
        let id = f.book.propose("ES", Side::Sell, dec!(1), None).unwrap();
        let err = f
            .book
            .attempt_transition(id, PositionState::Managed, "skip ahead")
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition(_)));
        assert_eq!(f.book.get(id).unwrap().state, PositionState::Proposed);
        assert_eq!(
            f.audit.count(&AuditQuery::of_type(AuditRecordType::PositionTransitionRejected)),
            1
        );
    }

    #[test]
    fn test_disconnect_on_submit_revokes_tier() {
        let f = fixture(FaultProfile::perfect());
        let id = approved(&f);
        let other = approved(&f);
        f.broker.crash();
        assert_eq!(
            f.book.submit(id),
            Err(LifecycleError::Broker(BrokerError::Disconnected))
        );
        assert_eq!(f.coordinator.tier(), DegradationTier::T1);
        assert_eq!(f.book.submit(other), Err(LifecycleError::TierGated(DegradationTier::T1)));
    }

    #[test]
    fn test_synchronous_rejection() {
        let f = fixture(FaultProfile {
            rejection_probability: 1.0,
            ..FaultProfile::perfect()
        });
        let id = approved(&f);
        assert!(matches!(f.book.submit(id), Err(LifecycleError::Broker(BrokerError::Rejected(_)))));
        assert_eq!(f.book.get(id).unwrap().state, PositionState::Rejected);
        assert_eq!(f.book.counts_by_state()[&PositionState::Rejected], 1);
    }
}
