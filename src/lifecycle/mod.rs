//! Process lifecycle: shutdown signals and the exit fail-safe

mod failsafe;
mod shutdown;

pub use failsafe::reenable_attached;
pub use shutdown::ShutdownSignal;
