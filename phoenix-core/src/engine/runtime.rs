//! Runtime wiring
//!
//! [`PhoenixRuntime`] owns every governance component and the threads that
//! drive them:
//!
//! ```text
//!  phoenix-supervisor   heartbeat checks, reconnection, liveness beacon
//!  phoenix-engine       fill stream → position book, stall timer,
//!                       reconciliation pump, tier re-evaluation
//!  phoenix-halt-signals SIGTERM / SIGUSR1 → cascade halt (optional)
//! ```
//!
//! Tests build the runtime on a `ManualClock` and call [`PhoenixRuntime::step`]
//! by hand instead of spawning threads.

use super::position_book::{PositionBook, LIFECYCLE_COMPONENT};
use super::reconciliation::{ReconcileTrigger, ReconciliationRecord, ReconciliationStats, Reconciler};
use crate::audit::{AuditLog, AuditRecordType};
use crate::broker::{build_brokerage, BrokerEvent, BrokerMode, Brokerage};
use crate::config::{ConfigError, PhoenixConfig};
use crate::core::clock::{CancelToken, Clock, SleepOutcome};
use crate::core::position_fsm::PositionState;
use crate::governance::{DegradationTier, GovernanceCoordinator, GovernanceSnapshot, HealthLevel};
use crate::governance::coordinator::OperatorError;
use crate::monitoring::alerts::{
    AlertDispatcher, AlertSeverity, AlertSink, AlertStats, JsonlFileSink, LogSink,
};
use crate::resilience::backoff::Backoff;
use crate::resilience::halt::{self, HaltMode, HaltPropagator, HaltReceipt};
use crate::resilience::panic::contain;
use crate::resilience::supervisor::{
    HeartbeatHandle, Supervisor, SupervisorError, SupervisorHandle, SupervisorStatus,
};
use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel::{Receiver, TryRecvError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Everything an operator needs to see at once
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub tier: DegradationTier,
    pub health: HealthLevel,
    /// Human-readable reason of the most recent transition
    pub reason: String,
    pub governance: GovernanceSnapshot,
    pub supervisor: SupervisorStatus,
    pub positions: BTreeMap<PositionState, usize>,
    pub open_drift: Vec<ReconciliationRecord>,
    pub reconciliation: ReconciliationStats,
    pub alerts: AlertStats,
    pub audit_records: usize,
    pub audit_write_failures: u64,
    pub uptime_ms: u64,
}

/// What one engine pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub events: usize,
    pub stalled: usize,
    pub reconciled: bool,
}

#[derive(Serialize)]
struct ConfigAppliedRecord<'a> {
    reason: &'a str,
    /// Sections now in force
    applied: &'a [&'static str],
    /// Requested sections that only take effect on restart
    deferred: &'a [&'static str],
    config: &'a PhoenixConfig,
}

const ALL_SECTIONS: [&str; 12] = [
    "breaker",
    "backoff",
    "health",
    "heartbeat",
    "degradation",
    "lifecycle",
    "reconciliation",
    "halt",
    "alerts",
    "audit",
    "broker",
    "metrics",
];

const HOT_SECTIONS: [&str; 4] = ["health", "degradation", "lifecycle", "reconciliation"];

/// Owner of the whole governance stack
pub struct PhoenixRuntime {
    config: RwLock<PhoenixConfig>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    alerts: Arc<AlertDispatcher>,
    halt: Arc<HaltPropagator>,
    coordinator: Arc<GovernanceCoordinator>,
    broker: Arc<dyn Brokerage>,
    book: Arc<PositionBook>,
    reconciler: Arc<Reconciler>,
    supervisor: Arc<Supervisor>,
    /// Broker traffic counts as a heartbeat
    beats: HeartbeatHandle,
    fills: Mutex<Option<Receiver<BrokerEvent>>>,
    supervisor_handle: Mutex<Option<SupervisorHandle>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop: CancelToken,
    started_at_ms: u64,
}

impl std::fmt::Debug for PhoenixRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoenixRuntime")
            .field("tier", &self.coordinator.tier())
            .field("broker", &self.broker.name())
            .finish()
    }
}

impl PhoenixRuntime {
    /// Build the stack with the brokerage selected by `broker.mode`
    pub fn from_config(config: PhoenixConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let mode = BrokerMode::parse(&config.broker.mode)
            .ok_or_else(|| anyhow!("unsupported broker mode {:?}", config.broker.mode))?;
        let broker = build_brokerage(
            mode,
            &config.broker.account_id,
            (&config.broker.fault).into(),
            clock.clone(),
        );
        Self::new(config, clock, broker)
    }

    /// Build the stack around an existing brokerage
    ///
    /// Nothing runs until [`connect`](Self::connect) and
    /// [`spawn`](Self::spawn) (or manual [`step`](Self::step) calls).
    pub fn new(
        config: PhoenixConfig,
        clock: Arc<dyn Clock>,
        broker: Arc<dyn Brokerage>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let audit = Arc::new(match &config.audit.path {
            Some(path) => AuditLog::open(path, clock.clone())
                .with_context(|| format!("Failed to open audit log {:?}", path))?,
            None => AuditLog::in_memory(clock.clone()),
        });

        let alerts = Arc::new(AlertDispatcher::new(
            (&config.alerts).into(),
            clock.clone(),
            alert_sinks(&config)?,
        ));

        let halt = Arc::new(HaltPropagator::new(
            (&config.halt).into(),
            clock.clone(),
            audit.clone(),
        ));

        let coordinator = GovernanceCoordinator::new(
            (&config.health).into(),
            (&config.degradation).into(),
            clock.clone(),
            audit.clone(),
            alerts.clone(),
            halt.clone(),
        );

        let book = Arc::new(PositionBook::new(
            (&config.lifecycle).into(),
            (&config.breaker).into(),
            clock.clone(),
            audit.clone(),
            coordinator.clone(),
            broker.clone(),
        ));

        let supervisor = Arc::new(Supervisor::new(
            config.supervisor(),
            clock.clone(),
            audit.clone(),
            alerts.clone(),
            coordinator.clone(),
            broker.clone(),
            halt.clone(),
        ));
        book.attach_supervisor(supervisor.clone());

        let reconciler = Arc::new(Reconciler::new(
            (&config.reconciliation).into(),
            (&config.breaker).into(),
            clock.clone(),
            audit.clone(),
            alerts.clone(),
            coordinator.clone(),
            book.clone(),
            broker.clone(),
        ));

        audit.record(
            AuditRecordType::ConfigApplied,
            "runtime",
            &ConfigAppliedRecord {
                reason: "startup",
                applied: &ALL_SECTIONS,
                deferred: &[],
                config: &config,
            },
        );

        let started_at_ms = clock.wall_millis();
        info!(
            "Phoenix runtime built (broker={}, account={})",
            broker.name(),
            config.broker.account_id
        );

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            clock,
            audit,
            alerts,
            halt,
            coordinator,
            broker,
            book,
            reconciler,
            beats: supervisor.heartbeat_handle(),
            supervisor,
            fills: Mutex::new(None),
            supervisor_handle: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            stop: CancelToken::new(),
            started_at_ms,
        }))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> PhoenixConfig {
        self.config.read().clone()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn alerts(&self) -> &Arc<AlertDispatcher> {
        &self.alerts
    }

    pub fn halt(&self) -> &Arc<HaltPropagator> {
        &self.halt
    }

    pub fn coordinator(&self) -> &Arc<GovernanceCoordinator> {
        &self.coordinator
    }

    pub fn broker(&self) -> &Arc<dyn Brokerage> {
        &self.broker
    }

    pub fn book(&self) -> &Arc<PositionBook> {
        &self.book
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Initial connection with backoff, then identity validation
    ///
    /// The wait between attempts is cut short by a cascade halt.
    pub fn connect(&self) -> Result<()> {
        let expected = self.config.read().broker.account_id.clone();
        let mut backoff = Backoff::new((&self.config.read().backoff).into());
        let interrupt = self.halt.interrupt_token();

        loop {
            let attempt = contain(|| {
                self.broker.connect()?;
                self.broker.get_account()
            });
            match attempt {
                Ok(Ok(account)) if expected.is_empty() || account.account_id == expected => {
                    let events = self
                        .broker
                        .subscribe_fills()
                        .context("Failed to subscribe to the fill stream")?;
                    *self.fills.lock() = Some(events);
                    self.coordinator
                        .report_connection_validated(&account.account_id, account.session_id);
                    info!(
                        "Connected to {} (account {}, session {})",
                        self.broker.name(),
                        account.account_id,
                        account.session_id
                    );
                    return Ok(());
                }
                Ok(Ok(account)) => {
                    warn!(
                        "Account mismatch on connect: expected {}, broker reported {}",
                        expected, account.account_id
                    );
                    // a wrong account is never worth retrying blindly
                    if let Err(e) = self.broker.disconnect() {
                        debug!("Disconnect after account mismatch: {}", e);
                    }
                    bail!(
                        "broker reported account {} but {} is configured",
                        account.account_id,
                        expected
                    );
                }
                Ok(Err(e)) => warn!("Connect attempt {} failed: {}", backoff.attempt_count() + 1, e),
                Err(panic) => error!("Connector panicked during connect: {}", panic),
            }

            match backoff.wait(self.clock.as_ref(), &interrupt) {
                Some(SleepOutcome::Elapsed) => continue,
                Some(SleepOutcome::Cancelled) => bail!("connect interrupted by halt"),
                None => bail!(
                    "broker unreachable after {} attempts",
                    backoff.policy().max_attempts
                ),
            }
        }
    }

    /// One engine pass: drain broker events, run the stall timer, pump
    /// reconciliation and re-derive the tier
    pub fn step(&self) -> StepReport {
        let mut report = StepReport::default();

        let mut filled = false;
        let mut resubscribe = false;
        {
            let fills = self.fills.lock();
            if let Some(events) = fills.as_ref() {
                loop {
                    match events.try_recv() {
                        Ok(event) => {
                            report.events += 1;
                            if matches!(event, BrokerEvent::Fill(_)) {
                                filled = true;
                            }
                            if let Err(e) = self.book.on_event(&event) {
                                warn!("Broker event not applied: {}", e);
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            resubscribe = true;
                            break;
                        }
                    }
                }
            }
        }
        if report.events > 0 {
            self.beats.beat();
        }
        if resubscribe {
            self.resubscribe();
        }
        if filled {
            self.reconciler.trigger(ReconcileTrigger::Fill);
        }

        report.stalled = self.book.check_stalls().len();

        match self.reconciler.pump() {
            Some(Ok(run)) => {
                report.reconciled = true;
                debug!("Reconciliation run: {:?}", run);
            }
            Some(Err(e)) => warn!("Reconciliation deferred: {}", e),
            None => {}
        }

        self.coordinator.evaluate();
        report
    }

    fn resubscribe(&self) {
        match self.broker.subscribe_fills() {
            Ok(events) => {
                info!("Fill stream re-subscribed");
                *self.fills.lock() = Some(events);
            }
            Err(e) => {
                debug!("Fill stream unavailable: {}", e);
                *self.fills.lock() = None;
            }
        }
    }

    /// Start the supervisor and engine threads
    pub fn spawn(self: &Arc<Self>) -> io::Result<()> {
        let handle = self.supervisor.clone().spawn()?;
        *self.supervisor_handle.lock() = Some(handle);

        let runtime = self.clone();
        let stop = self.stop.clone();
        let engine = thread::Builder::new()
            .name("phoenix-engine".to_string())
            .spawn(move || {
                info!("Engine loop started");
                while !stop.is_cancelled() {
                    if runtime.fills.lock().is_none() && runtime.coordinator.snapshot().connection.validated {
                        runtime.resubscribe();
                    }
                    if let Err(panic) = contain(|| runtime.step()) {
                        error!("Engine step panicked: {}", panic);
                    }
                    let period = Duration::from_millis(runtime.config.read().lifecycle.stall_check_ms);
                    runtime.clock.sleep(period, &stop);
                }
                info!("Engine loop stopped");
            })?;
        self.threads.lock().push(engine);
        Ok(())
    }

    /// Route SIGTERM / SIGUSR1 to the cascade halt
    pub fn install_signal_handlers(self: &Arc<Self>) -> io::Result<()> {
        let weak = Arc::downgrade(self);
        halt::install_signal_handlers(move |mode, reason| {
            if let Some(runtime) = weak.upgrade() {
                runtime.operator_halt(mode, reason, "signal");
            }
        })
    }

    /// Stop every thread and disconnect
    pub fn shutdown(&self) {
        info!("Phoenix runtime shutting down");
        self.stop.cancel();
        if let Some(handle) = self.supervisor_handle.lock().take() {
            handle.join();
        }
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                error!("Runtime thread terminated by panic");
            }
        }
        if let Err(e) = self.broker.disconnect() {
            debug!("Disconnect on shutdown: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.supervisor_handle
            .lock()
            .as_ref()
            .map_or(false, |h| h.is_running())
    }

    // ------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------

    pub fn operator_halt(&self, mode: HaltMode, reason: &str, actor: &str) -> HaltReceipt {
        self.coordinator.operator_halt(mode, reason, actor)
    }

    /// Release a halt and restart parked or exhausted reconnection
    pub fn operator_release(&self, actor: &str) -> Result<(), OperatorError> {
        self.coordinator.operator_release(actor)?;
        match self.supervisor.operator_retry(actor) {
            Ok(()) => info!("Reconnection resumed by {}", actor),
            Err(SupervisorError::NothingToRetry(_)) => {}
            Err(e) => warn!("Reconnection not resumed: {}", e),
        }
        Ok(())
    }

    /// Apply a new configuration to the running stack
    ///
    /// Thresholds for health, degradation, lifecycle and reconciliation take
    /// effect immediately. Changes to any other section are recorded as
    /// deferred and stay out of the live configuration until restart.
    pub fn reconfigure(&self, config: PhoenixConfig) -> Result<(), ConfigError> {
        config.validate()?;

        let (live, deferred) = {
            let current = self.config.read();
            let mut deferred = Vec::new();
            if current.breaker != config.breaker {
                deferred.push("breaker");
            }
            if current.backoff != config.backoff {
                deferred.push("backoff");
            }
            if current.heartbeat != config.heartbeat {
                deferred.push("heartbeat");
            }
            if current.halt != config.halt {
                deferred.push("halt");
            }
            if current.alerts != config.alerts {
                deferred.push("alerts");
            }
            if current.audit != config.audit {
                deferred.push("audit");
            }
            if current.broker != config.broker {
                deferred.push("broker");
            }
            if current.metrics != config.metrics {
                deferred.push("metrics");
            }

            let mut live = current.clone();
            live.health = config.health;
            live.degradation = config.degradation;
            live.lifecycle = config.lifecycle;
            live.reconciliation = config.reconciliation;
            (live, deferred)
        };
        if !deferred.is_empty() {
            warn!(
                "Configuration sections {:?} changed; they apply on next start",
                deferred
            );
        }

        self.coordinator
            .apply_config((&live.health).into(), (&live.degradation).into());
        self.book.set_config((&live.lifecycle).into());
        self.reconciler.set_config((&live.reconciliation).into());

        self.audit.record(
            AuditRecordType::ConfigApplied,
            "runtime",
            &ConfigAppliedRecord {
                reason: "reconfigure",
                applied: &HOT_SECTIONS,
                deferred: &deferred,
                config: &live,
            },
        );
        *self.config.write() = live;
        info!("Configuration applied");
        Ok(())
    }

    pub fn status(&self) -> RuntimeStatus {
        let governance = self.coordinator.snapshot();
        let reconciliation = self.reconciler.stats();
        RuntimeStatus {
            tier: governance.tier,
            health: governance.health.level,
            reason: governance.last_transition_reason.clone(),
            supervisor: self.supervisor.status(),
            positions: self.book.counts_by_state(),
            open_drift: self.reconciler.open_records(),
            reconciliation,
            alerts: self.alerts.stats(),
            audit_records: self.audit.len(),
            audit_write_failures: self.audit.write_failures(),
            uptime_ms: self.clock.wall_millis().saturating_sub(self.started_at_ms),
            governance,
        }
    }

    /// True when the lifecycle halt switch currently blocks new capital
    pub fn capital_blocked(&self) -> bool {
        self.coordinator.tier() != DegradationTier::T2
            || self.halt.switch(LIFECYCLE_COMPONENT).is_engaged()
    }
}

impl Drop for PhoenixRuntime {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Alert sinks from configuration
fn alert_sinks(config: &PhoenixConfig) -> Result<Vec<Arc<dyn AlertSink>>> {
    let min_severity = parse_severity(&config.alerts.log_min_severity)?;
    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink { min_severity })];
    if let Some(path) = &config.alerts.jsonl_path {
        sinks.push(Arc::new(JsonlFileSink {
            path: path.clone(),
            min_severity,
        }));
    }
    Ok(sinks)
}

fn parse_severity(name: &str) -> Result<AlertSeverity> {
    match name {
        "Info" => Ok(AlertSeverity::Info),
        "Warning" => Ok(AlertSeverity::Warning),
        "Error" => Ok(AlertSeverity::Error),
        "Critical" => Ok(AlertSeverity::Critical),
        other => bail!("unknown alert severity {:?}", other),
    }
}
