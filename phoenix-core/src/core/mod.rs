pub mod clock;
pub mod errors;
pub mod position_fsm;
pub mod types;

pub use clock::{CancelToken, Clock, ManualClock, SleepOutcome, SystemClock};
pub use errors::{BrokerError, ErrorClass, LifecycleError, TransitionError};
pub use position_fsm::{Position, PositionState, TransitionEntry};
pub use types::{ActionKind, PositionId, Side};
