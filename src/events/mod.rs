//! Indicator events published for status displays
//!
//! The lock controller and the device watcher publish these on a broadcast
//! channel. The tray (through IPC) and the [`IndicatorNotifier`] consume
//! them.

mod notifier;

use serde::{Deserialize, Serialize};

pub use notifier::IndicatorNotifier;

/// Status symbols shown by the indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndicatorEvent {
    /// At least one security key is attached
    KeyPresent,

    /// No security key is attached
    KeyAbsent,

    /// Keys were enabled for an unlock session
    Unlocked,

    /// Keys were disabled
    Locked,
}

impl std::fmt::Display for IndicatorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndicatorEvent::KeyPresent => write!(f, "KEY_PRESENT"),
            IndicatorEvent::KeyAbsent => write!(f, "KEY_ABSENT"),
            IndicatorEvent::Unlocked => write!(f, "UNLOCKED"),
            IndicatorEvent::Locked => write!(f, "LOCKED"),
        }
    }
}
