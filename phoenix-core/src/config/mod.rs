//! Configuration loading
//!
//! A TOML file provides the base, `PHOENIX__SECTION__FIELD` environment
//! variables override it. Every threshold the governance layer uses is
//! loaded here; nothing downstream hard-codes policy.

pub mod types;

pub use types::*;

use crate::broker::BrokerMode;
use anyhow::Context;
use config::builder::DefaultState;
use config::{Config as ConfigLoader, ConfigBuilder, Environment, File};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Builder seeded with the values an operator most often leaves out
fn defaults() -> anyhow::Result<ConfigBuilder<DefaultState>> {
    let builder = ConfigLoader::builder()
        .set_default("broker.mode", "simulated")?
        .set_default("broker.account_id", "PAPER-001")?
        .set_default("metrics.listen_addr", "127.0.0.1:9464")?
        .set_default("metrics.log_level", "info")?;
    Ok(builder)
}

impl PhoenixConfig {
    /// Load configuration from a TOML file with environment overrides
    ///
    /// Environment variables use the `PHOENIX` prefix with `__` between
    /// sections, e.g. `PHOENIX__HEALTH__CRITICAL_FAILURES=20`.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();

        let cfg = defaults()?
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("PHOENIX").separator("__"))
            .build()
            .context(format!("Failed to load config from {:?}", path))?;

        let config: PhoenixConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Defaults plus environment overrides, no file
    pub fn load_default() -> anyhow::Result<Self> {
        let cfg = defaults()?
            .add_source(Environment::with_prefix("PHOENIX").separator("__"))
            .build()
            .context("Failed to read environment configuration")?;

        let config: PhoenixConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Parse an in-memory TOML document (tests and tooling)
    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        let cfg = defaults()?
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?;

        let config: PhoenixConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Check every cross-field constraint, reporting all violations at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.breaker.failure_threshold == 0 {
            problems.push("breaker.failure_threshold must be at least 1".to_string());
        }
        if self.breaker.failure_window_secs == 0 {
            problems.push("breaker.failure_window_secs must be positive".to_string());
        }
        if self.breaker.recovery_timeout_secs == 0 {
            problems.push("breaker.recovery_timeout_secs must be positive".to_string());
        }

        if self.backoff.base_interval_ms == 0 {
            problems.push("backoff.base_interval_ms must be positive".to_string());
        }
        if self.backoff.max_interval_ms < self.backoff.base_interval_ms {
            problems.push(format!(
                "backoff.max_interval_ms ({}) must be >= base_interval_ms ({})",
                self.backoff.max_interval_ms, self.backoff.base_interval_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_fraction) {
            problems.push(format!(
                "backoff.jitter_fraction must be between 0.0 and 1.0, got {}",
                self.backoff.jitter_fraction
            ));
        }
        if self.backoff.max_attempts == 0 {
            problems.push("backoff.max_attempts must be at least 1".to_string());
        }

        let h = &self.health;
        if h.degraded_failures == 0 {
            problems.push("health.degraded_failures must be at least 1".to_string());
        }
        if h.critical_failures <= h.degraded_failures {
            problems.push(format!(
                "health.critical_failures ({}) must exceed degraded_failures ({})",
                h.critical_failures, h.degraded_failures
            ));
        }
        if let Some(halt) = h.halt_failures {
            if halt <= h.critical_failures {
                problems.push(format!(
                    "health.halt_failures ({}) must exceed critical_failures ({})",
                    halt, h.critical_failures
                ));
            }
        }
        if h.failure_window_secs == 0 {
            problems.push("health.failure_window_secs must be positive".to_string());
        }

        let hb = &self.heartbeat;
        if hb.interval_secs == 0 {
            problems.push("heartbeat.interval_secs must be positive".to_string());
        }
        if hb.jitter_secs >= hb.interval_secs && hb.interval_secs > 0 {
            problems.push("heartbeat.jitter_secs must be smaller than interval_secs".to_string());
        }
        if hb.missed_before_dead == 0 {
            problems.push("heartbeat.missed_before_dead must be at least 1".to_string());
        }
        if hb.tick_ms == 0 {
            problems.push("heartbeat.tick_ms must be positive".to_string());
        }
        if hb.liveness_interval_secs == 0 {
            problems.push("heartbeat.liveness_interval_secs must be positive".to_string());
        }
        if hb.liveness_silence_bound_secs <= hb.liveness_interval_secs {
            problems.push(
                "heartbeat.liveness_silence_bound_secs must exceed liveness_interval_secs".to_string(),
            );
        }

        if self.degradation.revoke_within_ms == 0 {
            problems.push("degradation.revoke_within_ms must be positive".to_string());
        }
        if self.degradation.halt_after_secs == 0 {
            problems.push("degradation.halt_after_secs must be positive".to_string());
        }

        if self.lifecycle.ack_timeout_secs == 0 {
            problems.push("lifecycle.ack_timeout_secs must be positive".to_string());
        }
        if self.lifecycle.stall_check_ms == 0 {
            problems.push("lifecycle.stall_check_ms must be positive".to_string());
        }

        let r = &self.reconciliation;
        if r.interval_secs == 0 {
            problems.push("reconciliation.interval_secs must be positive".to_string());
        }
        if r.max_checks_per_minute == 0 {
            problems.push("reconciliation.max_checks_per_minute must be at least 1".to_string());
        }
        if r.size_critical_threshold.is_sign_negative() {
            problems.push("reconciliation.size_critical_threshold must not be negative".to_string());
        }
        if r.pnl_tolerance.is_sign_negative() {
            problems.push("reconciliation.pnl_tolerance must not be negative".to_string());
        }

        if self.halt.local_bound_ms == 0 || self.halt.cascade_bound_ms == 0 {
            problems.push("halt bounds must be positive".to_string());
        }
        if self.halt.cascade_bound_ms < self.halt.local_bound_ms {
            problems.push("halt.cascade_bound_ms must be >= local_bound_ms".to_string());
        }

        if self.alerts.rate_limit_per_minute == 0 {
            problems.push("alerts.rate_limit_per_minute must be at least 1".to_string());
        }
        if !matches!(
            self.alerts.log_min_severity.as_str(),
            "Info" | "Warning" | "Error" | "Critical"
        ) {
            problems.push(format!(
                "alerts.log_min_severity must be Info, Warning, Error or Critical, got {:?}",
                self.alerts.log_min_severity
            ));
        }

        if BrokerMode::parse(&self.broker.mode).is_none() {
            problems.push(format!("broker.mode {:?} is not supported", self.broker.mode));
        }
        let f = &self.broker.fault;
        for (name, p) in [
            ("fill_probability", f.fill_probability),
            ("partial_fill_probability", f.partial_fill_probability),
            ("rejection_probability", f.rejection_probability),
            ("ack_probability", f.ack_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                problems.push(format!("broker.fault.{} must be between 0.0 and 1.0, got {}", name, p));
            }
        }
        if f.latency_max_ms < f.latency_min_ms {
            problems.push("broker.fault.latency_max_ms must be >= latency_min_ms".to_string());
        }

        if self.metrics.enabled && self.metrics.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            problems.push(format!(
                "metrics.listen_addr {:?} is not a socket address",
                self.metrics.listen_addr
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
