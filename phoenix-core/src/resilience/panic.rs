//! Panic handling
//!
//! Two pieces:
//! - [`contain`] runs a closure (typically a brokerage connector call) under
//!   `catch_unwind` so a crashing connector becomes an error value for its
//!   caller instead of unwinding the supervisor thread
//! - [`install_panic_handler`] logs every uncontained panic through tracing
//!   and terminates the process; contained panics are logged and left to
//!   their caller
//!
//! # Usage
//!
//! ```no_run
//! use phoenix_core::resilience::install_panic_handler;
//!
//! fn main() {
//!     install_panic_handler();
//!     // ... rest of application
//! }
//! ```

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use tracing::{error, warn};

thread_local! {
    static CONTAINED: Cell<u32> = const { Cell::new(0) };
}

/// Run `f`, turning a panic into `Err(message)`
pub fn contain<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    CONTAINED.with(|c| c.set(c.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    CONTAINED.with(|c| c.set(c.get().saturating_sub(1)));
    result.map_err(|payload| panic_message(payload.as_ref()))
}

fn is_contained() -> bool {
    CONTAINED.with(|c| c.get() > 0)
}

/// Best-effort extraction of a panic payload's message
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<no message>".to_string()
    }
}

/// Install a global panic hook
///
/// Uncontained panics are logged, handed to the default hook (backtrace when
/// RUST_BACKTRACE=1) and end the process with status 1. Panics inside
/// [`contain`] are only logged.
pub fn install_panic_handler() {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "<unknown location>".to_string());
        let message = panic_message(panic_info.payload());

        if is_contained() {
            warn!(
                location = %location,
                message = %message,
                "Contained panic in isolated call"
            );
            return;
        }

        error!(
            location = %location,
            message = %message,
            "PANIC: governance layer crashed. Shutting down."
        );

        // backup in case tracing is misconfigured
        eprintln!("═══════════════════════════════════════════════════════════");
        eprintln!("FATAL PANIC");
        eprintln!("Location: {}", location);
        eprintln!("Message:  {}", message);
        eprintln!("═══════════════════════════════════════════════════════════");

        default_hook(panic_info);

        // let tracing flush
        std::thread::sleep(std::time::Duration::from_millis(100));
        process::exit(1);
    }));

    tracing::info!("Panic handler installed - uncontained panics terminate the process");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contain_returns_value() {
        assert_eq!(contain(|| 42), Ok(42));
    }

    #[test]
    fn test_contain_catches_panic() {
        let result: Result<(), String> = contain(|| panic!("connector exploded"));
        assert_eq!(result, Err("connector exploded".to_string()));
        assert!(!is_contained());
    }

    #[test]
    fn test_nested_contain() {
        let outer = contain(|| {
            let inner: Result<u8, String> = contain(|| panic!("inner"));
            assert!(is_contained());
            inner.is_err()
        });
        assert_eq!(outer, Ok(true));
    }
}
