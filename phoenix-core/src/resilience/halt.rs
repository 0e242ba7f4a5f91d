//! Halt propagation - bounded-latency stop signal
//!
//! Two scopes:
//! - **local**: one component's [`HaltSwitch`] stops admitting new
//!   capital-committing actions (bound 50ms)
//! - **cascade**: every registered switch is engaged and every outstanding
//!   interrupt token is cancelled, so backoff and reconnect waits end at once
//!   (bound 500ms)
//!
//! The check on the hot path is a single atomic load; delivery never waits on
//! another component's loop.
//!
//! ## Modes
//!
//! - **ExitOnly** (default): existing positions may still be closed or
//!   cancelled, only new capital-committing actions are refused
//! - **Freeze**: every locally initiated broker action is refused
//!
//! ## Signals
//!
//! - **SIGTERM**: cascade halt, exit-only
//! - **SIGUSR1**: cascade halt, freeze

use crate::audit::{AuditLog, AuditRecordType};
use crate::core::clock::{CancelToken, Clock};
use crate::core::types::ActionKind;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// How strict an engaged halt is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum HaltMode {
    /// Block new capital-committing actions only
    ExitOnly = 1,
    /// Block every locally initiated broker action
    Freeze = 2,
}

impl HaltMode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ExitOnly),
            2 => Some(Self::Freeze),
            _ => None,
        }
    }

    /// Whether `kind` is still allowed under this mode
    pub fn permits(&self, kind: ActionKind) -> bool {
        match (self, kind) {
            (_, ActionKind::Bookkeeping) => true,
            (HaltMode::ExitOnly, ActionKind::RiskReducing) => true,
            (HaltMode::ExitOnly, ActionKind::CapitalCommitting) => false,
            (HaltMode::Freeze, _) => false,
        }
    }
}

impl fmt::Display for HaltMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltMode::ExitOnly => write!(f, "EXIT_ONLY"),
            HaltMode::Freeze => write!(f, "FREEZE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HaltScope {
    Local,
    Cascade,
}

/// Configuration for halt delivery
#[derive(Debug, Clone, PartialEq)]
pub struct HaltConfig {
    /// Latency bound for a local halt
    pub local_bound: Duration,
    /// Latency bound for a full cascade
    pub cascade_bound: Duration,
    /// Install SIGTERM / SIGUSR1 handlers at start-up
    pub install_signal_handlers: bool,
}

impl Default for HaltConfig {
    fn default() -> Self {
        Self {
            local_bound: Duration::from_millis(50),
            cascade_bound: Duration::from_millis(500),
            install_signal_handlers: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HaltError {
    #[error("no halt switch registered for component {0}")]
    UnknownComponent(String),

    #[error("halt release requires a named operator")]
    MissingActor,

    #[error("no halt is engaged")]
    NotEngaged,
}

// ============================================================================
// HaltSwitch
// ============================================================================

/// Per-component halt flag, checked lock-free
#[derive(Debug)]
pub struct HaltSwitch {
    component: String,
    state: AtomicU8,
}

impl HaltSwitch {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: AtomicU8::new(0),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    #[inline]
    pub fn mode(&self) -> Option<HaltMode> {
        HaltMode::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_engaged(&self) -> bool {
        self.mode().is_some()
    }

    /// `Err(mode)` when an engaged halt refuses `kind`
    #[inline]
    pub fn check(&self, kind: ActionKind) -> Result<(), HaltMode> {
        match self.mode() {
            Some(mode) if !mode.permits(kind) => Err(mode),
            _ => Ok(()),
        }
    }

    /// Engage; a stricter mode already set is kept
    fn engage(&self, mode: HaltMode) {
        self.state.fetch_max(mode as u8, Ordering::AcqRel);
    }

    fn clear(&self) {
        self.state.store(0, Ordering::Release);
    }
}

// ============================================================================
// HaltPropagator
// ============================================================================

/// Result of delivering a halt
#[derive(Debug, Clone, Serialize)]
pub struct HaltReceipt {
    pub scope: HaltScope,
    pub mode: HaltMode,
    pub reason: String,
    pub components: Vec<String>,
    /// Real time from trigger to every switch engaged
    #[serde(with = "duration_micros")]
    pub latency: Duration,
    pub within_bound: bool,
}

/// Read-only view of the propagator
#[derive(Debug, Clone, Default, Serialize)]
pub struct HaltStatus {
    pub engaged: bool,
    pub scope: Option<HaltScope>,
    pub mode: Option<HaltMode>,
    pub reason: Option<String>,
    pub engaged_at_ms: Option<u64>,
    pub locally_halted: Vec<String>,
    pub cascades: u64,
}

#[derive(Debug, Default)]
struct HaltRecord {
    cascade: Option<(HaltMode, String, u64)>,
    cascades: u64,
}

#[derive(Serialize)]
struct HaltEngagedRecord<'a> {
    scope: HaltScope,
    mode: HaltMode,
    reason: &'a str,
    components: &'a [String],
    latency_us: u64,
}

#[derive(Serialize)]
struct HaltReleasedRecord<'a> {
    scope: HaltScope,
    components: &'a [String],
    actor: &'a str,
}

/// Delivers halts to every registered component
pub struct HaltPropagator {
    config: HaltConfig,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    switches: RwLock<Vec<Arc<HaltSwitch>>>,
    interrupt: Mutex<CancelToken>,
    record: Mutex<HaltRecord>,
}

impl fmt::Debug for HaltPropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HaltPropagator")
            .field("status", &self.status())
            .finish()
    }
}

impl HaltPropagator {
    pub fn new(config: HaltConfig, clock: Arc<dyn Clock>, audit: Arc<AuditLog>) -> Self {
        Self {
            config,
            clock,
            audit,
            switches: RwLock::new(Vec::new()),
            interrupt: Mutex::new(CancelToken::new()),
            record: Mutex::new(HaltRecord::default()),
        }
    }

    /// Register (or fetch) the switch for `component`
    pub fn switch(&self, component: &str) -> Arc<HaltSwitch> {
        if let Some(existing) = self.find(component) {
            return existing;
        }
        let mut switches = self.switches.write();
        if let Some(existing) = switches.iter().find(|s| s.component() == component) {
            return existing.clone();
        }
        let switch = Arc::new(HaltSwitch::new(component));
        // a component registered mid-cascade starts halted
        if let Some((mode, _, _)) = &self.record.lock().cascade {
            switch.engage(*mode);
        }
        switches.push(switch.clone());
        switch
    }

    fn find(&self, component: &str) -> Option<Arc<HaltSwitch>> {
        self.switches
            .read()
            .iter()
            .find(|s| s.component() == component)
            .cloned()
    }

    /// Token cancelled by the next cascade halt
    ///
    /// After a release, newly issued tokens belong to the next epoch.
    pub fn interrupt_token(&self) -> CancelToken {
        self.interrupt.lock().clone()
    }

    /// Halt a single component
    pub fn halt_local(
        &self,
        component: &str,
        mode: HaltMode,
        reason: &str,
    ) -> Result<HaltReceipt, HaltError> {
        let started = Instant::now();
        let switch = self
            .find(component)
            .ok_or_else(|| HaltError::UnknownComponent(component.to_string()))?;
        switch.engage(mode);
        let latency = started.elapsed();

        let components = vec![component.to_string()];
        let within_bound = latency <= self.config.local_bound;
        if within_bound {
            warn!("Local halt on {} ({}): {}", component, mode, reason);
        } else {
            error!(
                "Local halt on {} exceeded bound: {:?} > {:?}",
                component, latency, self.config.local_bound
            );
        }
        self.audit.record(
            AuditRecordType::HaltEngaged,
            component,
            &HaltEngagedRecord {
                scope: HaltScope::Local,
                mode,
                reason,
                components: &components,
                latency_us: latency.as_micros() as u64,
            },
        );

        Ok(HaltReceipt {
            scope: HaltScope::Local,
            mode,
            reason: reason.to_string(),
            components,
            latency,
            within_bound,
        })
    }

    /// Halt every registered component and cancel pending waits
    pub fn halt_cascade(&self, mode: HaltMode, reason: &str) -> HaltReceipt {
        let started = Instant::now();
        // recorded before any switch is engaged so a concurrent `switch()` either
        // sees the cascade or is already in the list engaged below
        {
            let mut record = self.record.lock();
            let effective = match &record.cascade {
                Some((existing, _, _)) => (*existing).max(mode),
                None => mode,
            };
            if record.cascade.is_none() {
                record.cascades += 1;
            }
            record.cascade = Some((effective, reason.to_string(), self.clock.wall_millis()));
        }
        let components: Vec<String> = {
            let switches = self.switches.read();
            for switch in switches.iter() {
                switch.engage(mode);
            }
            switches.iter().map(|s| s.component().to_string()).collect()
        };
        self.interrupt.lock().cancel();
        let latency = started.elapsed();

        let within_bound = latency <= self.config.cascade_bound;
        if within_bound {
            error!(
                "HALT CASCADE ({}) reached {} components in {:?}: {}",
                mode,
                components.len(),
                latency,
                reason
            );
        } else {
            error!(
                "HALT CASCADE exceeded bound: {:?} > {:?} ({})",
                latency, self.config.cascade_bound, reason
            );
        }
        self.audit.record(
            AuditRecordType::HaltEngaged,
            "halt",
            &HaltEngagedRecord {
                scope: HaltScope::Cascade,
                mode,
                reason,
                components: &components,
                latency_us: latency.as_micros() as u64,
            },
        );

        HaltReceipt {
            scope: HaltScope::Cascade,
            mode,
            reason: reason.to_string(),
            components,
            latency,
            within_bound,
        }
    }

    /// Operator release of a cascade halt (and every local halt)
    pub fn release(&self, actor: &str) -> Result<(), HaltError> {
        if actor.trim().is_empty() {
            return Err(HaltError::MissingActor);
        }
        let components: Vec<String> = {
            let switches = self.switches.read();
            let engaged: Vec<String> = switches
                .iter()
                .filter(|s| s.is_engaged())
                .map(|s| s.component().to_string())
                .collect();
            let mut record = self.record.lock();
            if record.cascade.is_none() && engaged.is_empty() {
                return Err(HaltError::NotEngaged);
            }
            for switch in switches.iter() {
                switch.clear();
            }
            record.cascade = None;
            engaged
        };
        *self.interrupt.lock() = CancelToken::new();

        info!("Halt released by {} ({} components)", actor, components.len());
        self.audit.record(
            AuditRecordType::HaltReleased,
            "halt",
            &HaltReleasedRecord {
                scope: HaltScope::Cascade,
                components: &components,
                actor,
            },
        );
        Ok(())
    }

    /// Operator release of one component's local halt
    pub fn release_local(&self, component: &str, actor: &str) -> Result<(), HaltError> {
        if actor.trim().is_empty() {
            return Err(HaltError::MissingActor);
        }
        if self.is_cascade_engaged() {
            // a cascade is only lifted as a whole
            return Err(HaltError::NotEngaged);
        }
        let switch = self
            .find(component)
            .ok_or_else(|| HaltError::UnknownComponent(component.to_string()))?;
        if !switch.is_engaged() {
            return Err(HaltError::NotEngaged);
        }
        switch.clear();
        info!("Local halt on {} released by {}", component, actor);
        let components = [component.to_string()];
        self.audit.record(
            AuditRecordType::HaltReleased,
            component,
            &HaltReleasedRecord {
                scope: HaltScope::Local,
                components: &components,
                actor,
            },
        );
        Ok(())
    }

    #[inline]
    pub fn is_cascade_engaged(&self) -> bool {
        self.record.lock().cascade.is_some()
    }

    pub fn cascade_mode(&self) -> Option<HaltMode> {
        self.record.lock().cascade.as_ref().map(|(mode, _, _)| *mode)
    }

    pub fn status(&self) -> HaltStatus {
        let locally_halted: Vec<String> = self
            .switches
            .read()
            .iter()
            .filter(|s| s.is_engaged())
            .map(|s| s.component().to_string())
            .collect();
        let record = self.record.lock();
        match &record.cascade {
            Some((mode, reason, at)) => HaltStatus {
                engaged: true,
                scope: Some(HaltScope::Cascade),
                mode: Some(*mode),
                reason: Some(reason.clone()),
                engaged_at_ms: Some(*at),
                locally_halted,
                cascades: record.cascades,
            },
            None => HaltStatus {
                engaged: !locally_halted.is_empty(),
                scope: (!locally_halted.is_empty()).then_some(HaltScope::Local),
                locally_halted,
                cascades: record.cascades,
                ..Default::default()
            },
        }
    }

    pub fn config(&self) -> &HaltConfig {
        &self.config
    }
}

/// Route SIGTERM / SIGUSR1 to `on_signal` from a dedicated thread
///
/// `on_signal` receives the mode and a reason; it should go through the
/// governance coordinator so tier and health see the halt.
#[cfg(unix)]
pub fn install_signal_handlers<F>(on_signal: F) -> std::io::Result<()>
where
    F: Fn(HaltMode, &str) + Send + 'static,
{
    use signal_hook::consts::{SIGTERM, SIGUSR1};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGTERM, SIGUSR1])?;
    std::thread::Builder::new()
        .name("phoenix-halt-signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGTERM => on_signal(HaltMode::ExitOnly, "SIGTERM received"),
                    SIGUSR1 => on_signal(HaltMode::Freeze, "SIGUSR1 received"),
                    _ => {}
                }
            }
        })?;
    info!("Halt signal handlers installed (SIGTERM exit-only, SIGUSR1 freeze)");
    Ok(())
}

#[cfg(not(unix))]
pub fn install_signal_handlers<F>(_on_signal: F) -> std::io::Result<()>
where
    F: Fn(HaltMode, &str) + Send + 'static,
{
    warn!("Halt signal handlers are only available on unix");
    Ok(())
}

mod duration_micros {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }
}
