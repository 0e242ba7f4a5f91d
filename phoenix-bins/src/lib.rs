//! Phoenix binaries
//!
//! Shared start-up code for the paper runner, the external watchdog and the
//! audit inspection tool.

pub mod common;
