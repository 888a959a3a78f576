//! Unlock sessions
//!
//! At most one session runs at a time; the lock controller awaits it inline.

mod monitor;

pub use monitor::{SessionConfig, SessionMonitor};
