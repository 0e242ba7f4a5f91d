//! Operator alert channel
//!
//! Alerts go through an [`AlertDispatcher`] which applies:
//! - a per-class debounce window (a burst of the same alert class sends once)
//! - a global per-minute rate limit
//! - a bypass of both for CRITICAL severity
//!
//! Suppressed alerts are counted in [`AlertStats`], never silently lost.

use crate::core::clock::Clock;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertSeverity {
    /// Informational alerts (no action required)
    Info = 0,
    /// Warning alerts (should investigate)
    Warning = 1,
    /// Error alerts (requires attention)
    Error = 2,
    /// Critical alerts (immediate action required)
    Critical = 3,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Alert class, the unit of debouncing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertClass {
    HealthEpisode,
    HealthCritical,
    HeartbeatDead,
    ReconnectExhausted,
    ReconciliationDrift,
    HaltEngaged,
    TierChange,
    SupervisorSilent,
}

impl AlertClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HealthEpisode => "HEALTH_EPISODE",
            Self::HealthCritical => "HEALTH_CRITICAL",
            Self::HeartbeatDead => "HEARTBEAT_DEAD",
            Self::ReconnectExhausted => "RECONNECT_EXHAUSTED",
            Self::ReconciliationDrift => "RECONCILIATION_DRIFT",
            Self::HaltEngaged => "HALT_ENGAGED",
            Self::TierChange => "TIER_CHANGE",
            Self::SupervisorSilent => "SUPERVISOR_SILENT",
        }
    }
}

impl fmt::Display for AlertClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub class: AlertClass,
    pub severity: AlertSeverity,
    pub message: String,
    pub details: BTreeMap<String, String>,
    /// Unix millis, stamped by the dispatcher
    pub timestamp_ms: u64,
}

impl Alert {
    pub fn new(class: AlertClass, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            class,
            severity,
            message: message.into(),
            details: BTreeMap::new(),
            timestamp_ms: 0,
        }
    }

    pub fn critical(class: AlertClass, message: impl Into<String>) -> Self {
        Self::new(class, AlertSeverity::Critical, message)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }

    /// Format alert for display
    pub fn format(&self) -> String {
        let mut output = format!(
            "[{}] {} - {}",
            self.severity.as_str(),
            self.class,
            self.message
        );
        for (key, value) in &self.details {
            output.push_str(&format!(" {}={}", key, value));
        }
        output
    }

    /// Format alert as JSON for structured logging
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize alert to JSON")
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Outbound notification channel
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    fn deliver(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts through tracing at a level matching their severity
#[derive(Debug, Clone)]
pub struct LogSink {
    pub min_severity: AlertSeverity,
}

impl Default for LogSink {
    fn default() -> Self {
        Self {
            min_severity: AlertSeverity::Warning,
        }
    }
}

impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, alert: &Alert) -> Result<()> {
        if alert.severity < self.min_severity {
            return Ok(());
        }
        let formatted = alert.format();
        match alert.severity {
            AlertSeverity::Info => info!("{}", formatted),
            AlertSeverity::Warning => warn!("{}", formatted),
            AlertSeverity::Error | AlertSeverity::Critical => error!("{}", formatted),
        }
        Ok(())
    }
}

/// Appends alerts as JSON lines
#[derive(Debug, Clone)]
pub struct JsonlFileSink {
    pub path: PathBuf,
    pub min_severity: AlertSeverity,
}

impl AlertSink for JsonlFileSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn deliver(&self, alert: &Alert) -> Result<()> {
        if alert.severity < self.min_severity {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open alert log file")?;
        let json = alert.to_json()?;
        writeln!(file, "{}", json).context("Failed to write alert to file")?;
        file.flush().context("Failed to flush alert log file")?;
        Ok(())
    }
}

/// Keeps every delivered alert in memory (tests, status surfaces)
#[derive(Debug, Default)]
pub struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self, class: AlertClass) -> usize {
        self.alerts.lock().iter().filter(|a| a.class == class).count()
    }

    pub fn clear(&self) {
        self.alerts.lock().clear();
    }
}

impl AlertSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn deliver(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Alert dispatcher configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AlertConfig {
    /// Minimum spacing between two alerts of the same class
    pub debounce_window: Duration,
    /// Non-critical alerts admitted per rolling minute
    pub rate_limit_per_minute: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(5),
            rate_limit_per_minute: 30,
        }
    }
}

/// What happened to a dispatched alert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Delivered,
    Debounced,
    RateLimited,
}

/// Counters for every alert the dispatcher has seen
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertStats {
    pub delivered: u64,
    pub debounced: u64,
    pub rate_limited: u64,
    pub sink_failures: u64,
    pub by_class: BTreeMap<AlertClass, u64>,
}

#[derive(Default)]
struct DispatchState {
    last_by_class: HashMap<AlertClass, Instant>,
    sent_window: VecDeque<Instant>,
    stats: AlertStats,
}

/// Central alert dispatcher
pub struct AlertDispatcher {
    config: AlertConfig,
    clock: Arc<dyn Clock>,
    sinks: Vec<Arc<dyn AlertSink>>,
    state: Mutex<DispatchState>,
}

impl fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("config", &self.config)
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig, clock: Arc<dyn Clock>, sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        info!("AlertDispatcher initialized with {} sinks", sinks.len());
        Self {
            config,
            clock,
            sinks,
            state: Mutex::new(DispatchState::default()),
        }
    }

    /// Send an alert through every sink, subject to debounce and rate limit
    pub fn dispatch(&self, mut alert: Alert) -> AlertOutcome {
        let now = self.clock.now();
        alert.timestamp_ms = self.clock.wall_millis();
        {
            let mut state = self.state.lock();
            *state.stats.by_class.entry(alert.class).or_insert(0) += 1;

            if alert.severity != AlertSeverity::Critical {
                if let Some(last) = state.last_by_class.get(&alert.class) {
                    if now.saturating_duration_since(*last) < self.config.debounce_window {
                        state.stats.debounced += 1;
                        debug!("Alert {} debounced", alert.class);
                        return AlertOutcome::Debounced;
                    }
                }

                while let Some(&oldest) = state.sent_window.front() {
                    if now.saturating_duration_since(oldest) >= Duration::from_secs(60) {
                        state.sent_window.pop_front();
                    } else {
                        break;
                    }
                }
                if state.sent_window.len() as u32 >= self.config.rate_limit_per_minute {
                    state.stats.rate_limited += 1;
                    debug!("Alert {} rate limited", alert.class);
                    return AlertOutcome::RateLimited;
                }
                state.sent_window.push_back(now);
            }

            state.last_by_class.insert(alert.class, now);
            state.stats.delivered += 1;
        }

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&alert) {
                error!("Failed to deliver alert to {}: {}", sink.name(), e);
                self.state.lock().stats.sink_failures += 1;
            }
        }
        AlertOutcome::Delivered
    }

    pub fn stats(&self) -> AlertStats {
        self.state.lock().stats.clone()
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use tempfile::tempdir;

    fn dispatcher(config: AlertConfig) -> (AlertDispatcher, Arc<RecordingSink>, Arc<ManualClock>) {
        let clock = ManualClock::shared();
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = AlertDispatcher::new(config, clock.clone(), vec![sink.clone()]);
        (dispatcher, sink, clock)
    }

    #[test]
    fn test_alert_formatting() {
        let alert = Alert::new(
            AlertClass::HeartbeatDead,
            AlertSeverity::Error,
            "Broker heartbeat lost",
        )
        .with_detail("missed", 3);

        let formatted = alert.format();
        assert!(formatted.contains("ERROR"));
        assert!(formatted.contains("HEARTBEAT_DEAD"));
        assert!(formatted.contains("missed=3"));
    }

    #[test]
    fn test_debounce_per_class() {
        let (dispatcher, sink, clock) = dispatcher(AlertConfig::default());
        let warn = || Alert::new(AlertClass::HealthEpisode, AlertSeverity::Warning, "burst");

        assert_eq!(dispatcher.dispatch(warn()), AlertOutcome::Delivered);
        assert_eq!(dispatcher.dispatch(warn()), AlertOutcome::Debounced);
        // other classes are independent
        assert_eq!(
            dispatcher.dispatch(Alert::new(AlertClass::TierChange, AlertSeverity::Info, "T1")),
            AlertOutcome::Delivered
        );

        clock.advance(Duration::from_secs(5));
        assert_eq!(dispatcher.dispatch(warn()), AlertOutcome::Delivered);
        assert_eq!(sink.count(AlertClass::HealthEpisode), 2);
        assert_eq!(dispatcher.stats().debounced, 1);
    }

    #[test]
    fn test_rate_limit_and_critical_bypass() {
        let (dispatcher, sink, _) = dispatcher(AlertConfig {
            debounce_window: Duration::ZERO,
            rate_limit_per_minute: 2,
        });
        let info = || Alert::new(AlertClass::TierChange, AlertSeverity::Info, "tier");

        assert_eq!(dispatcher.dispatch(info()), AlertOutcome::Delivered);
        assert_eq!(dispatcher.dispatch(info()), AlertOutcome::Delivered);
        assert_eq!(dispatcher.dispatch(info()), AlertOutcome::RateLimited);

        for _ in 0..3 {
            assert_eq!(
                dispatcher.dispatch(Alert::critical(AlertClass::HealthCritical, "critical")),
                AlertOutcome::Delivered
            );
        }
        assert_eq!(sink.count(AlertClass::HealthCritical), 3);
        let stats = dispatcher.stats();
        assert_eq!(stats.rate_limited, 1);
        assert_eq!(stats.delivered, 5);
    }

    #[test]
    fn test_jsonl_sink() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let sink = JsonlFileSink {
            path: path.clone(),
            min_severity: AlertSeverity::Info,
        };
        sink.deliver(&Alert::critical(AlertClass::HaltEngaged, "halt cascade"))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("HALT_ENGAGED"));
        assert!(contents.contains("halt cascade"));
    }

    #[test]
    fn test_alert_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::Error);
        assert!(AlertSeverity::Error > AlertSeverity::Warning);
        assert!(AlertSeverity::Warning > AlertSeverity::Info);
    }
}
