//! # Kairos
//!
//! A single-shot timer whose `reset` is safe to call at any point in the
//! timer's life.
//!
//! A timer delivers exactly one [`Instant`](std::time::Instant) into a
//! capacity-1 channel when its deadline passes. Resetting a timer that has
//! fired but whose value was never received discards that stale value, so
//! the next receive waits for the new deadline instead of returning
//! immediately with the old one.
//!
//! ## Features
//!
//! - **Exactly once**: every firing delivers one value, never early
//! - **Race-free stop/reset**: firing, stopping and resetting are ordered by
//!   a single lock per clock
//! - **Runtime independent**: each clock fires timers from its own thread, so
//!   timers work from async tasks and plain threads alike
//! - **Cancellation**: dropping a pending timer cancels it, and a clock's
//!   dispatcher stops when its `CancellationToken` is cancelled
//!
//! ## Quick Start
//!
//! ```rust
//! use kairos::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kairos::TimerError> {
//!     let mut timer = kairos::new_timer(Duration::from_millis(10));
//!
//!     // Let it fire without receiving the value...
//!     tokio::time::sleep(Duration::from_millis(50)).await;
//!
//!     // ...then reschedule. The old value is gone.
//!     let was_active = timer.reset(Duration::from_millis(20))?;
//!     assert!(!was_active);
//!     assert!(!timer.is_ready());
//!
//!     let fired_at = timer.recv().await;
//!     assert!(fired_at.is_some());
//!     Ok(())
//! }
//! ```

mod clock;
mod dispatcher;
mod error;
mod heap;
mod timer;

use std::time::Instant;

pub use clock::Clock;
pub use error::TimerError;
pub use timer::Timer;

// Re-export commonly used types for convenience
pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;

/// Create a timer on the global clock that fires after `delay`.
pub fn new_timer(delay: Duration) -> Timer {
    Clock::global().new_timer(delay)
}

/// Create a timer on the global clock that fires at `deadline`.
pub fn new_timer_at(deadline: Instant) -> Timer {
    Clock::global().new_timer_at(deadline)
}

/// Create an unscheduled timer on the global clock.
pub fn new_stopped_timer() -> Timer {
    Clock::global().new_stopped_timer()
}
