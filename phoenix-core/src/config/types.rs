use crate::broker::FaultProfile;
use crate::engine::position_book::LifecycleConfig;
use crate::engine::reconciliation::ReconciliationConfig;
use crate::governance::{DegradationConfig, HealthConfig};
use crate::monitoring::alerts::AlertConfig;
use crate::resilience::backoff::BackoffPolicy;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::halt::HaltConfig;
use crate::resilience::supervisor::{HeartbeatConfig, SupervisorConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoenixConfig {
    pub breaker: BreakerSettings,
    pub backoff: BackoffSettings,
    pub health: HealthSettings,
    pub heartbeat: HeartbeatSettings,
    pub degradation: DegradationSettings,
    pub lifecycle: LifecycleSettings,
    pub reconciliation: ReconciliationSettings,
    pub halt: HaltSettings,
    pub alerts: AlertSettings,
    pub audit: AuditSettings,
    pub broker: BrokerSettings,
    pub metrics: MetricsSettings,
}

/// Circuit breaker thresholds (applied to every registered breaker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_secs: 60,
            recovery_timeout_secs: 60,
        }
    }
}

/// Reconnection backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    /// 0.0 to 1.0
    pub jitter_fraction: f64,
    /// Automatic reconnect attempts before operator intervention
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_interval_ms: 1_000,
            max_interval_ms: 60_000,
            jitter_fraction: 0.1,
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub degraded_failures: u32,
    pub critical_failures: u32,
    /// Harder threshold for CRITICAL → HALTED; unset means override only
    pub halt_failures: Option<u32>,
    pub failure_window_secs: u64,
    pub recovery_timeout_secs: u64,
    pub episode_quiet_period_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            degraded_failures: 3,
            critical_failures: 10,
            halt_failures: None,
            failure_window_secs: 60,
            recovery_timeout_secs: 120,
            episode_quiet_period_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_secs: u64,
    pub jitter_secs: u64,
    pub missed_before_dead: u32,
    pub liveness_interval_secs: u64,
    pub liveness_silence_bound_secs: u64,
    /// File the external watchdog reads
    pub beacon_path: Option<PathBuf>,
    pub tick_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            jitter_secs: 5,
            missed_before_dead: 3,
            liveness_interval_secs: 10,
            liveness_silence_bound_secs: 30,
            beacon_path: None,
            tick_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationSettings {
    /// Hard bound on T2 revocation after a disconnect
    pub revoke_within_ms: u64,
    /// Unresolved disconnect that drops the tier to T0
    pub halt_after_secs: u64,
}

impl Default for DegradationSettings {
    fn default() -> Self {
        Self {
            revoke_within_ms: 1_000,
            halt_after_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub ack_timeout_secs: u64,
    /// Granularity of the stall timer loop
    pub stall_check_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 60,
            stall_check_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationSettings {
    pub interval_secs: u64,
    pub max_checks_per_minute: u32,
    pub size_critical_threshold: Decimal,
    pub pnl_tolerance: Decimal,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_checks_per_minute: 12,
            size_critical_threshold: Decimal::ONE,
            pnl_tolerance: Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaltSettings {
    pub local_bound_ms: u64,
    pub cascade_bound_ms: u64,
    /// SIGTERM → cascade EXIT_ONLY, SIGUSR1 → cascade FREEZE
    pub install_signal_handlers: bool,
}

impl Default for HaltSettings {
    fn default() -> Self {
        Self {
            local_bound_ms: 50,
            cascade_bound_ms: 500,
            install_signal_handlers: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub debounce_window_secs: u64,
    pub rate_limit_per_minute: u32,
    /// "Info", "Warning", "Error" or "Critical"
    pub log_min_severity: String,
    pub jsonl_path: Option<PathBuf>,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            debounce_window_secs: 5,
            rate_limit_per_minute: 30,
            log_min_severity: "Warning".to_string(),
            jsonl_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// JSONL audit file; in-memory only when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Backend selection; only "simulated" ships in this workspace
    pub mode: String,
    pub account_id: String,
    pub fault: FaultSettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            mode: "simulated".to_string(),
            account_id: "PAPER-001".to_string(),
            fault: FaultSettings::default(),
        }
    }
}

/// Fault injection for the simulated backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultSettings {
    pub fill_probability: f64,
    pub partial_fill_probability: f64,
    pub rejection_probability: f64,
    pub ack_probability: f64,
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,
    pub seed: u64,
}

impl Default for FaultSettings {
    fn default() -> Self {
        let p = FaultProfile::default();
        Self {
            fill_probability: p.fill_probability,
            partial_fill_probability: p.partial_fill_probability,
            rejection_probability: p.rejection_probability,
            ack_probability: p.ack_probability,
            latency_min_ms: p.latency_min_ms,
            latency_max_ms: p.latency_max_ms,
            seed: p.seed,
        }
    }
}

/// Metrics and status surface configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub listen_addr: String,
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9464".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

// ============================================================================
// Conversions into runtime configuration
// ============================================================================

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(s: &BreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold,
            failure_window: Duration::from_secs(s.failure_window_secs),
            recovery_timeout: Duration::from_secs(s.recovery_timeout_secs),
        }
    }
}

impl From<&BackoffSettings> for BackoffPolicy {
    fn from(s: &BackoffSettings) -> Self {
        Self {
            base_interval: Duration::from_millis(s.base_interval_ms),
            max_interval: Duration::from_millis(s.max_interval_ms),
            jitter_fraction: s.jitter_fraction,
            max_attempts: s.max_attempts,
        }
    }
}

impl From<&HealthSettings> for HealthConfig {
    fn from(s: &HealthSettings) -> Self {
        Self {
            degraded_failures: s.degraded_failures,
            critical_failures: s.critical_failures,
            halt_failures: s.halt_failures,
            failure_window: Duration::from_secs(s.failure_window_secs),
            recovery_timeout: Duration::from_secs(s.recovery_timeout_secs),
            episode_quiet_period: Duration::from_secs(s.episode_quiet_period_secs),
        }
    }
}

impl From<&DegradationSettings> for DegradationConfig {
    fn from(s: &DegradationSettings) -> Self {
        Self {
            revoke_within: Duration::from_millis(s.revoke_within_ms),
            halt_after: Duration::from_secs(s.halt_after_secs),
        }
    }
}

impl From<&LifecycleSettings> for LifecycleConfig {
    fn from(s: &LifecycleSettings) -> Self {
        Self {
            ack_timeout: Duration::from_secs(s.ack_timeout_secs),
        }
    }
}

impl From<&ReconciliationSettings> for ReconciliationConfig {
    fn from(s: &ReconciliationSettings) -> Self {
        Self {
            interval: Duration::from_secs(s.interval_secs),
            max_checks_per_minute: s.max_checks_per_minute,
            size_critical_threshold: s.size_critical_threshold,
            pnl_tolerance: s.pnl_tolerance,
        }
    }
}

impl From<&HaltSettings> for HaltConfig {
    fn from(s: &HaltSettings) -> Self {
        Self {
            local_bound: Duration::from_millis(s.local_bound_ms),
            cascade_bound: Duration::from_millis(s.cascade_bound_ms),
            install_signal_handlers: s.install_signal_handlers,
        }
    }
}

impl From<&AlertSettings> for AlertConfig {
    fn from(s: &AlertSettings) -> Self {
        Self {
            debounce_window: Duration::from_secs(s.debounce_window_secs),
            rate_limit_per_minute: s.rate_limit_per_minute,
        }
    }
}

impl From<&FaultSettings> for FaultProfile {
    fn from(s: &FaultSettings) -> Self {
        Self {
            fill_probability: s.fill_probability,
            partial_fill_probability: s.partial_fill_probability,
            rejection_probability: s.rejection_probability,
            ack_probability: s.ack_probability,
            latency_min_ms: s.latency_min_ms,
            latency_max_ms: s.latency_max_ms,
            seed: s.seed,
        }
    }
}

impl PhoenixConfig {
    /// Supervisor configuration assembled from the heartbeat, backoff and
    /// broker sections
    pub fn supervisor(&self) -> SupervisorConfig {
        let h = &self.heartbeat;
        SupervisorConfig {
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(h.interval_secs),
                jitter: Duration::from_secs(h.jitter_secs),
                missed_before_dead: h.missed_before_dead,
            },
            backoff: (&self.backoff).into(),
            expected_account_id: self.broker.account_id.clone(),
            liveness_interval: Duration::from_secs(h.liveness_interval_secs),
            liveness_silence_bound: Duration::from_secs(h.liveness_silence_bound_secs),
            beacon_path: h.beacon_path.clone(),
            tick: Duration::from_millis(h.tick_ms),
        }
    }
}
