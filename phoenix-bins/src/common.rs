//! Common utilities for all binaries
//!
//! Shared initialization, CLI parsing, and setup code.

use anyhow::Result;
use clap::Args;
use phoenix_core::config::PhoenixConfig;
use phoenix_core::utils::init_logger;
use std::path::PathBuf;
use tracing::info;

/// Common CLI arguments for all binaries
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// TOML configuration file (defaults plus PHOENIX__* environment if absent)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level, overrides `metrics.log_level`
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

impl CommonArgs {
    /// Load configuration and install the tracing subscriber
    pub fn init(&self) -> Result<PhoenixConfig> {
        let config = match &self.config {
            Some(path) => PhoenixConfig::load(path)?,
            None => PhoenixConfig::load_default()?,
        };
        let level = self.log_level.as_deref().unwrap_or(&config.metrics.log_level);
        init_logging(level, self.json_logs || config.metrics.json_logs);
        match &self.config {
            Some(path) => info!("Configuration loaded from {}", path.display()),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }
}

/// Initialize tracing/logging
pub fn init_logging(level: &str, json_logs: bool) {
    init_logger(level, json_logs);
}

/// Log the headline of a status snapshot
pub fn log_status(status: &phoenix_core::RuntimeStatus) {
    info!(
        tier = %status.tier,
        health = %status.health,
        heartbeat = status.supervisor.heartbeat.as_str(),
        open_drift = status.open_drift.len(),
        audit_records = status.audit_records,
        "Status: {}",
        status.reason
    );
    for (state, count) in &status.positions {
        info!("  - {}: {}", state, count);
    }
}
