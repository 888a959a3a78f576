//! Lock state machine
//!
//! - Uninitialized: no security key seen yet
//! - Locked: keys disabled, waiting for the hotkey
//! - Unlocked: keys enabled while an unlock session runs
//! - Exiting: keys re-enabled for shutdown (terminal)

mod machine;
mod signal;

pub use machine::LockController;
pub use signal::{Signal, SIGNAL_QUEUE_CAPACITY};

#[cfg(test)]
pub(crate) use signal::drain_latest;
