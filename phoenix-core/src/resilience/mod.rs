//! Failure containment primitives
//!
//! - [`circuit_breaker`]: per-component fail-fast with a single recovery trial
//! - [`backoff`]: capped exponential retry intervals with jitter
//! - [`supervisor`]: out-of-band broker liveness and reconnection
//! - [`halt`]: local and cascade halts with bounded delivery latency
//! - [`panic`]: panic containment for connector calls and the process hook

pub mod backoff;
pub mod circuit_breaker;
pub mod halt;
pub mod panic;
pub mod supervisor;

pub use backoff::{Backoff, BackoffPolicy, BACKOFF_MULTIPLIER};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use halt::{
    install_signal_handlers, HaltConfig, HaltError, HaltMode, HaltPropagator, HaltReceipt, HaltScope,
    HaltStatus, HaltSwitch,
};
pub use panic::{contain, install_panic_handler, panic_message};
pub use supervisor::{
    Heartbeat, HeartbeatConfig, HeartbeatHandle, HeartbeatStatus, ReconnectPhase, Supervisor,
    SupervisorBeacon, SupervisorConfig, SupervisorError, SupervisorHandle, SupervisorStatus,
};
