//! Deterministic test harness
//!
//! Builds the full governance stack on a [`ManualClock`] with a
//! [`SimulatedBroker`] and a [`RecordingSink`], without spawning threads.
//! Tests drive time with [`Harness::advance`] and run the supervisor by
//! hand with [`Harness::tick`].

use crate::audit::{AuditLog, AuditQuery, AuditRecordType};
use crate::broker::{Brokerage, FaultProfile, SimulatedBroker};
use crate::core::clock::{Clock, ManualClock};
use crate::core::errors::{BrokerError, LifecycleError};
use crate::core::position_fsm::PositionState;
use crate::core::types::{PositionId, Side};
use crate::engine::position_book::{LifecycleConfig, PositionBook};
use crate::engine::reconciliation::{ReconciliationConfig, Reconciler};
use crate::governance::{DegradationConfig, GovernanceCoordinator, HealthConfig};
use crate::monitoring::alerts::{AlertConfig, AlertDispatcher, AlertSink, RecordingSink};
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::halt::{HaltConfig, HaltPropagator};
use crate::resilience::supervisor::{Supervisor, SupervisorConfig};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

pub const ACCOUNT_ID: &str = "PAPER-TEST";

/// Tunables for [`Harness::build`]
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub profile: FaultProfile,
    pub breaker: CircuitBreakerConfig,
    pub health: HealthConfig,
    pub degradation: DegradationConfig,
    pub lifecycle: LifecycleConfig,
    pub reconciliation: ReconciliationConfig,
    pub supervisor: SupervisorConfig,
    pub halt: HaltConfig,
    pub alerts: AlertConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            profile: FaultProfile::perfect(),
            breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
            degradation: DegradationConfig::default(),
            lifecycle: LifecycleConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            supervisor: SupervisorConfig {
                expected_account_id: ACCOUNT_ID.to_string(),
                ..SupervisorConfig::default()
            },
            halt: HaltConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

/// The whole stack on virtual time
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub audit: Arc<AuditLog>,
    pub alerts: Arc<AlertDispatcher>,
    pub recorder: Arc<RecordingSink>,
    pub halt: Arc<HaltPropagator>,
    pub coordinator: Arc<GovernanceCoordinator>,
    pub broker: Arc<SimulatedBroker>,
    pub book: Arc<PositionBook>,
    pub reconciler: Arc<Reconciler>,
    pub supervisor: Arc<Supervisor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(HarnessConfig::default())
    }

    pub fn build(config: HarnessConfig) -> Self {
        let clock = ManualClock::shared();
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let audit = Arc::new(AuditLog::in_memory(dyn_clock.clone()));
        let recorder = Arc::new(RecordingSink::new());
        let sinks: Vec<Arc<dyn AlertSink>> = vec![recorder.clone()];
        let alerts = Arc::new(AlertDispatcher::new(config.alerts, dyn_clock.clone(), sinks));
        let halt = Arc::new(HaltPropagator::new(config.halt, dyn_clock.clone(), audit.clone()));
        let coordinator = GovernanceCoordinator::new(
            config.health,
            config.degradation,
            dyn_clock.clone(),
            audit.clone(),
            alerts.clone(),
            halt.clone(),
        );
        let broker = Arc::new(SimulatedBroker::new(ACCOUNT_ID, config.profile, dyn_clock.clone()));
        let dyn_broker: Arc<dyn Brokerage> = broker.clone();
        let book = Arc::new(PositionBook::new(
            config.lifecycle,
            config.breaker.clone(),
            dyn_clock.clone(),
            audit.clone(),
            coordinator.clone(),
            dyn_broker.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            config.supervisor,
            dyn_clock.clone(),
            audit.clone(),
            alerts.clone(),
            coordinator.clone(),
            dyn_broker.clone(),
            halt.clone(),
        ));
        book.attach_supervisor(supervisor.clone());
        let reconciler = Arc::new(Reconciler::new(
            config.reconciliation,
            config.breaker,
            dyn_clock,
            audit.clone(),
            alerts.clone(),
            coordinator.clone(),
            book.clone(),
            dyn_broker,
        ));

        Self {
            clock,
            audit,
            alerts,
            recorder,
            halt,
            coordinator,
            broker,
            book,
            reconciler,
            supervisor,
        }
    }

    /// Connect the broker and validate the session (tier reaches T2)
    pub fn connect(&self) -> Result<(), BrokerError> {
        self.broker.connect()?;
        let account = self.broker.get_account()?;
        self.coordinator
            .report_connection_validated(&account.account_id, account.session_id);
        Ok(())
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Advance in `step` increments, ticking the supervisor after each
    pub fn run_for(&self, total: Duration, step: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.clock.advance(step);
            self.supervisor.tick();
            elapsed += step;
        }
    }

    pub fn tick(&self) {
        self.supervisor.tick();
    }

    /// Propose and approve a position
    pub fn approved(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
    ) -> Result<PositionId, LifecycleError> {
        let id = self
            .book
            .propose(symbol, side, quantity, Some(Decimal::ONE_HUNDRED))?;
        self.book.approve(id, "harness approval")?;
        Ok(id)
    }

    pub fn state_of(&self, id: PositionId) -> Option<PositionState> {
        self.book.get(id).map(|p| p.state)
    }

    pub fn audit_count(&self, record_type: AuditRecordType) -> usize {
        self.audit.count(&AuditQuery::of_type(record_type))
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
