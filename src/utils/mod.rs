pub mod clock;
pub mod graceful_shutdown;

pub use clock::{Clock, ManualClock, SystemClock};
pub use graceful_shutdown::{GracefulShutdown, ShutdownReason, ShutdownToken};
