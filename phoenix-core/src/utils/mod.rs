pub mod logger;

pub use logger::{init_logger, init_stderr_logger};
