//! Reconciliation engine
//!
//! Compares the internal position ledger against broker-reported truth and
//! records drift. The engine never touches positions: it only writes
//! [`ReconciliationRecord`]s, which stay open until an operator resolves them.
//!
//! Drift types:
//! - `POSITION_COUNT`: symbols with internal exposure vs non-flat broker
//!   positions (CRITICAL)
//! - `POSITION_SIZE`: per-symbol net quantity; WARNING up to
//!   `size_critical_threshold`, CRITICAL beyond
//! - `PNL`: internal average price marked at the broker mark vs the broker's
//!   unrealized PnL, beyond `pnl_tolerance` (WARNING)
//! - `ORDER_STATUS`: in-flight orders vs broker order state; CRITICAL when
//!   the broker reports fills the ledger does not know about
//!
//! Triggers (fill, periodic, on demand) are coalesced into one pending set;
//! at most `max_checks_per_minute` runs are admitted and pending triggers
//! wait for the next admitted slot instead of being dropped.
//!
//! Broker reads go through the `broker.reconcile` breaker; failed reads feed
//! the breaker and the health machine like any other broker call.

use super::position_book::PositionBook;
use crate::audit::{AuditLog, AuditRecordType};
use crate::broker::{AccountState, BrokerOrderState, BrokerPosition, Brokerage};
use crate::core::clock::Clock;
use crate::core::errors::{BrokerError, ErrorClass};
use crate::core::position_fsm::{Position, PositionState};
use crate::governance::GovernanceCoordinator;
use crate::monitoring::alerts::{Alert, AlertClass, AlertDispatcher, AlertSeverity};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Breaker guarding the broker truth reads
pub const RECONCILE_BREAKER: &str = "broker.reconcile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftType {
    PositionCount,
    PositionSize,
    Pnl,
    OrderStatus,
}

impl DriftType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftType::PositionCount => "POSITION_COUNT",
            DriftType::PositionSize => "POSITION_SIZE",
            DriftType::Pnl => "PNL",
            DriftType::OrderStatus => "ORDER_STATUS",
        }
    }
}

impl fmt::Display for DriftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftSeverity {
    Warning,
    Critical,
}

/// Operator verdict closing a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// The internal ledger was wrong and has been fixed
    PhoenixCorrected,
    /// The broker side was wrong and has been fixed
    BrokerCorrected,
    /// Known and accepted as is
    Acknowledged,
}

impl Resolution {
    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(Value::String(name.to_ascii_uppercase())).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileTrigger {
    Fill,
    Periodic,
    OnDemand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub id: u64,
    pub drift_type: DriftType,
    /// Identity used to fold repeated detections into one record
    pub key: String,
    pub internal_snapshot: Value,
    pub external_snapshot: Value,
    pub severity: DriftSeverity,
    pub detected_at_ms: u64,
    pub last_seen_at_ms: u64,
    pub occurrences: u64,
    pub resolution: Option<Resolution>,
    pub resolved_by: Option<String>,
    pub resolved_at_ms: Option<u64>,
}

impl ReconciliationRecord {
    pub fn is_open(&self) -> bool {
        self.resolution.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationConfig {
    pub interval: Duration,
    pub max_checks_per_minute: u32,
    /// Absolute size difference above which POSITION_SIZE is CRITICAL
    pub size_critical_threshold: Decimal,
    pub pnl_tolerance: Decimal,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_checks_per_minute: 12,
            size_critical_threshold: Decimal::ONE,
            pnl_tolerance: Decimal::ONE,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReconciliationError {
    #[error("unknown reconciliation record {0}")]
    UnknownRecord(u64),

    #[error("reconciliation record {0} is already resolved")]
    AlreadyResolved(u64),

    #[error("resolution requires a named operator")]
    MissingActor,

    #[error("broker truth unavailable: {0}")]
    Broker(#[from] BrokerError),

    #[error("breaker {0} open")]
    BreakerOpen(&'static str),
}

/// Outcome of one admitted run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub triggers: Vec<ReconcileTrigger>,
    pub new_records: Vec<u64>,
    pub repeated_records: Vec<u64>,
    pub checked_at_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationStats {
    pub runs: u64,
    /// Triggers folded into an already pending one
    pub coalesced: u64,
    /// Pump calls that found work but no admission slot
    pub deferred: u64,
    pub broker_failures: u64,
    pub open_records: usize,
    pub open_critical: usize,
}

/// A drift found in one run, before deduplication
#[derive(Debug, Clone)]
struct Finding {
    drift_type: DriftType,
    key: String,
    severity: DriftSeverity,
    internal: Value,
    external: Value,
}

struct Schedule {
    pending: BTreeSet<ReconcileTrigger>,
    runs: VecDeque<Instant>,
    next_periodic_at: Instant,
}

#[derive(Default)]
struct Ledger {
    records: Vec<ReconciliationRecord>,
    stats: ReconciliationStats,
}

#[derive(Serialize)]
struct ResolvedRecord<'a> {
    record_id: u64,
    drift_type: DriftType,
    resolution: Resolution,
    actor: &'a str,
}

/// Drift detector between the ledger and the broker
pub struct Reconciler {
    config: RwLock<ReconciliationConfig>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    alerts: Arc<AlertDispatcher>,
    coordinator: Arc<GovernanceCoordinator>,
    book: Arc<PositionBook>,
    broker: Arc<dyn Brokerage>,
    breaker: Arc<CircuitBreaker>,
    schedule: Mutex<Schedule>,
    ledger: Mutex<Ledger>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler").field("stats", &self.stats()).finish()
    }
}

impl Reconciler {
    pub fn new(
        config: ReconciliationConfig,
        breaker_config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        alerts: Arc<AlertDispatcher>,
        coordinator: Arc<GovernanceCoordinator>,
        book: Arc<PositionBook>,
        broker: Arc<dyn Brokerage>,
    ) -> Self {
        let next_periodic_at = clock.now() + config.interval;
        let breaker = coordinator.register_breaker(RECONCILE_BREAKER, breaker_config);
        Self {
            config: RwLock::new(config),
            clock,
            audit,
            alerts,
            coordinator,
            book,
            broker,
            breaker,
            schedule: Mutex::new(Schedule {
                pending: BTreeSet::new(),
                runs: VecDeque::new(),
                next_periodic_at,
            }),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn set_config(&self, config: ReconciliationConfig) {
        *self.config.write() = config;
    }

    /// Queue a trigger; duplicates fold into the pending one
    pub fn trigger(&self, trigger: ReconcileTrigger) {
        let inserted = self.schedule.lock().pending.insert(trigger);
        if !inserted {
            self.ledger.lock().stats.coalesced += 1;
        }
    }

    pub fn pending(&self) -> Vec<ReconcileTrigger> {
        self.schedule.lock().pending.iter().copied().collect()
    }

    /// Run once if there is pending work and a free slot
    pub fn pump(&self) -> Option<Result<ReconcileReport, ReconciliationError>> {
        let now = self.clock.now();
        let (interval, max_per_minute) = {
            let config = self.config.read();
            (config.interval, config.max_checks_per_minute)
        };
        let triggers: Vec<ReconcileTrigger> = {
            let mut schedule = self.schedule.lock();
            if now >= schedule.next_periodic_at {
                schedule.next_periodic_at = now + interval;
                schedule.pending.insert(ReconcileTrigger::Periodic);
            }
            if schedule.pending.is_empty() {
                return None;
            }
            while let Some(&oldest) = schedule.runs.front() {
                if now.saturating_duration_since(oldest) >= RATE_WINDOW {
                    schedule.runs.pop_front();
                } else {
                    break;
                }
            }
            if schedule.runs.len() as u32 >= max_per_minute {
                drop(schedule);
                self.ledger.lock().stats.deferred += 1;
                return None;
            }
            schedule.runs.push_back(now);
            std::mem::take(&mut schedule.pending).into_iter().collect()
        };

        let result = self.run(&triggers);
        if result.is_err() {
            // broker truth unavailable: keep the work for the next slot
            self.schedule.lock().pending.extend(triggers);
        }
        Some(result)
    }

    /// On-demand check, subject to the same rate limit
    pub fn reconcile_now(&self) -> Option<Result<ReconcileReport, ReconciliationError>> {
        self.trigger(ReconcileTrigger::OnDemand);
        self.pump()
    }

    fn run(&self, triggers: &[ReconcileTrigger]) -> Result<ReconcileReport, ReconciliationError> {
        if !self.breaker.allow_request() {
            debug!("Reconciliation skipped, breaker {} open", RECONCILE_BREAKER);
            self.ledger.lock().stats.broker_failures += 1;
            return Err(ReconciliationError::BreakerOpen(RECONCILE_BREAKER));
        }
        let fetched = self
            .broker
            .get_positions()
            .and_then(|positions| Ok((positions, self.broker.get_account()?)));
        let (broker_positions, account) = match fetched {
            Ok(truth) => {
                self.breaker.record_success();
                truth
            }
            Err(e) => {
                warn!("Reconciliation skipped, broker unavailable: {}", e);
                self.ledger.lock().stats.broker_failures += 1;
                self.on_broker_error(&e);
                return Err(e.into());
            }
        };

        let internal = self.book.open_positions();
        let config = self.config.read().clone();
        let findings = detect(&internal, &broker_positions, &account, &config);
        let now_ms = self.clock.wall_millis();

        let mut report = ReconcileReport {
            triggers: triggers.to_vec(),
            new_records: Vec::new(),
            repeated_records: Vec::new(),
            checked_at_ms: now_ms,
        };
        let mut critical = Vec::new();
        {
            let mut ledger = self.ledger.lock();
            ledger.stats.runs += 1;
            for finding in findings {
                if let Some(existing) = ledger
                    .records
                    .iter_mut()
                    .find(|r| r.is_open() && r.key == finding.key)
                {
                    existing.occurrences += 1;
                    existing.last_seen_at_ms = now_ms;
                    report.repeated_records.push(existing.id);
                    continue;
                }
                let record = ReconciliationRecord {
                    id: ledger.records.len() as u64 + 1,
                    drift_type: finding.drift_type,
                    key: finding.key,
                    internal_snapshot: finding.internal,
                    external_snapshot: finding.external,
                    severity: finding.severity,
                    detected_at_ms: now_ms,
                    last_seen_at_ms: now_ms,
                    occurrences: 1,
                    resolution: None,
                    resolved_by: None,
                    resolved_at_ms: None,
                };
                self.announce(&record);
                if record.severity == DriftSeverity::Critical {
                    critical.push(format!("{} {}", record.drift_type, record.key));
                }
                report.new_records.push(record.id);
                ledger.records.push(record);
            }
        }

        for detail in critical {
            self.coordinator
                .report_failure("reconciliation", ErrorClass::Critical, &detail);
        }
        debug!(
            "Reconciliation run ({:?}): {} new, {} repeated",
            report.triggers,
            report.new_records.len(),
            report.repeated_records.len()
        );
        Ok(report)
    }

    fn on_broker_error(&self, error: &BrokerError) {
        if error.counts_as_failure() {
            self.breaker.record_failure();
            self.coordinator
                .report_failure(RECONCILE_BREAKER, error.class(), &error.to_string());
        } else {
            self.breaker.record_success();
        }
        if error.is_disconnect() {
            self.coordinator
                .report_connection_lost(&format!("{RECONCILE_BREAKER}: {error}"));
        }
    }

    fn announce(&self, record: &ReconciliationRecord) {
        let severity = match record.severity {
            DriftSeverity::Critical => {
                error!("CRITICAL drift {} ({})", record.drift_type, record.key);
                AlertSeverity::Critical
            }
            DriftSeverity::Warning => {
                warn!("Drift {} ({})", record.drift_type, record.key);
                AlertSeverity::Warning
            }
        };
        self.audit
            .record(AuditRecordType::ReconciliationDrift, "reconciliation", record);
        self.alerts.dispatch(
            Alert::new(
                AlertClass::ReconciliationDrift,
                severity,
                format!("{} drift on {}", record.drift_type, record.key),
            )
            .with_detail("record_id", record.id)
            .with_detail("internal", &record.internal_snapshot)
            .with_detail("external", &record.external_snapshot),
        );
    }

    /// Close a record; the only way `resolution` is ever set
    pub fn resolve(
        &self,
        record_id: u64,
        resolution: Resolution,
        actor: &str,
    ) -> Result<ReconciliationRecord, ReconciliationError> {
        if actor.trim().is_empty() {
            return Err(ReconciliationError::MissingActor);
        }
        let now_ms = self.clock.wall_millis();
        let mut ledger = self.ledger.lock();
        let record = ledger
            .records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or(ReconciliationError::UnknownRecord(record_id))?;
        if !record.is_open() {
            return Err(ReconciliationError::AlreadyResolved(record_id));
        }
        record.resolution = Some(resolution);
        record.resolved_by = Some(actor.to_string());
        record.resolved_at_ms = Some(now_ms);
        info!("Drift record {} resolved as {:?} by {}", record_id, resolution, actor);
        self.audit.record(
            AuditRecordType::ReconciliationResolved,
            "reconciliation",
            &ResolvedRecord {
                record_id,
                drift_type: record.drift_type,
                resolution,
                actor,
            },
        );
        Ok(record.clone())
    }

    pub fn records(&self) -> Vec<ReconciliationRecord> {
        self.ledger.lock().records.clone()
    }

    pub fn open_records(&self) -> Vec<ReconciliationRecord> {
        self.ledger
            .lock()
            .records
            .iter()
            .filter(|r| r.is_open())
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ReconciliationStats {
        let ledger = self.ledger.lock();
        let mut stats = ledger.stats.clone();
        stats.open_records = ledger.records.iter().filter(|r| r.is_open()).count();
        stats.open_critical = ledger
            .records
            .iter()
            .filter(|r| r.is_open() && r.severity == DriftSeverity::Critical)
            .count();
        stats
    }
}

// ============================================================================
// Detection
// ============================================================================

#[derive(Default)]
struct SymbolBook {
    net: Decimal,
    /// Sum of |qty| × avg price over filled positions
    notional: Decimal,
    gross: Decimal,
    positions: Vec<String>,
}

fn internal_by_symbol(internal: &[Position]) -> BTreeMap<String, SymbolBook> {
    let mut books: BTreeMap<String, SymbolBook> = BTreeMap::new();
    for p in internal.iter().filter(|p| p.filled_quantity > Decimal::ZERO) {
        let book = books.entry(p.symbol.clone()).or_default();
        book.net += p.signed_exposure();
        book.notional += p.filled_quantity * p.avg_fill_price.unwrap_or(Decimal::ZERO);
        book.gross += p.filled_quantity;
        book.positions.push(p.id.to_string());
    }
    books
}

fn detect(
    internal: &[Position],
    broker_positions: &[BrokerPosition],
    account: &AccountState,
    config: &ReconciliationConfig,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    let books = internal_by_symbol(internal);
    let internal_symbols: Vec<&String> = books.keys().filter(|s| !books[*s].net.is_zero()).collect();
    let broker: BTreeMap<&str, &BrokerPosition> = broker_positions
        .iter()
        .filter(|p| !p.quantity.is_zero())
        .map(|p| (p.symbol.as_str(), p))
        .collect();

    if internal_symbols.len() != broker.len() {
        findings.push(Finding {
            drift_type: DriftType::PositionCount,
            key: DriftType::PositionCount.as_str().to_string(),
            severity: DriftSeverity::Critical,
            internal: json!({ "open": internal_symbols.len(), "symbols": internal_symbols }),
            external: json!({ "open": broker.len(), "symbols": broker.keys().collect::<Vec<_>>() }),
        });
    }

    let symbols: BTreeSet<&str> = books
        .keys()
        .map(String::as_str)
        .chain(broker.keys().copied())
        .collect();
    for symbol in symbols {
        let internal_net = books.get(symbol).map_or(Decimal::ZERO, |b| b.net);
        let external = broker.get(symbol);
        let external_net = external.map_or(Decimal::ZERO, |p| p.quantity);
        let diff = (internal_net - external_net).abs();
        if !diff.is_zero() {
            findings.push(Finding {
                drift_type: DriftType::PositionSize,
                key: format!("POSITION_SIZE:{symbol}"),
                severity: if diff > config.size_critical_threshold {
                    DriftSeverity::Critical
                } else {
                    DriftSeverity::Warning
                },
                internal: json!({ "symbol": symbol, "quantity": internal_net }),
                external: json!({ "symbol": symbol, "quantity": external_net }),
            });
            continue;
        }

        let (Some(book), Some(external)) = (books.get(symbol), external) else {
            continue;
        };
        if book.gross.is_zero() {
            continue;
        }
        let avg = book.notional / book.gross;
        let internal_pnl = (external.mark_price - avg) * internal_net;
        if (internal_pnl - external.unrealized_pnl).abs() > config.pnl_tolerance {
            findings.push(Finding {
                drift_type: DriftType::Pnl,
                key: format!("PNL:{symbol}"),
                severity: DriftSeverity::Warning,
                internal: json!({ "symbol": symbol, "avg_price": avg, "unrealized_pnl": internal_pnl }),
                external: json!({
                    "symbol": symbol,
                    "avg_price": external.avg_price,
                    "mark_price": external.mark_price,
                    "unrealized_pnl": external.unrealized_pnl,
                }),
            });
        }
    }

    for p in internal
        .iter()
        .filter(|p| matches!(p.state, PositionState::Submitted | PositionState::Stalled))
    {
        let Some(order_ref) = p.broker_order_ref.as_deref() else {
            continue;
        };
        let status = account.orders.iter().find(|o| o.broker_order_ref == order_ref);
        let severity = match status {
            None => Some(DriftSeverity::Warning),
            Some(o) if o.filled_quantity > p.filled_quantity => Some(DriftSeverity::Critical),
            Some(o) => match o.state {
                BrokerOrderState::Rejected | BrokerOrderState::Cancelled => Some(DriftSeverity::Warning),
                BrokerOrderState::Filled => Some(DriftSeverity::Critical),
                _ => None,
            },
        };
        if let Some(severity) = severity {
            findings.push(Finding {
                drift_type: DriftType::OrderStatus,
                key: format!("ORDER_STATUS:{order_ref}"),
                severity,
                internal: json!({
                    "position": p.id.to_string(),
                    "state": p.state,
                    "filled_quantity": p.filled_quantity,
                }),
                external: match status {
                    Some(o) => json!({ "state": o.state, "filled_quantity": o.filled_quantity }),
                    None => json!({ "state": null }),
                },
            });
        }
    }
    findings
}
