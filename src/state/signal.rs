//! Signals consumed by the lock controller and the coalescing read

use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::device::DeviceSet;

/// Capacity of every signal queue feeding the controller
pub const SIGNAL_QUEUE_CAPACITY: usize = 32;

/// State-relevant event, consumed at most once by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The watcher saw a different set of attached keys
    DeviceSetChanged(DeviceSet),
    /// The hotkey combination was pressed
    Activate,
    /// The unlock session saw device activity
    RelockTriggered,
    /// The unlock session reached its deadline
    RelockTimeout,
    /// Re-enable everything and terminate
    Exit,
}

/// Result of draining a queue
#[derive(Debug, PartialEq, Eq)]
pub struct Drained<T> {
    /// Most recently enqueued value, if anything was queued
    pub latest: Option<T>,
    /// Every sender has been dropped
    pub disconnected: bool,
}

/// Drain everything currently queued and keep only the last value
///
/// Intermediate values are discarded on purpose; popping one value per tick
/// would replay stale device sets after a burst.
pub fn drain_latest<T>(rx: &mut mpsc::Receiver<T>) -> Drained<T> {
    let mut latest = None;
    loop {
        match rx.try_recv() {
            Ok(value) => latest = Some(value),
            Err(TryRecvError::Empty) => {
                return Drained {
                    latest,
                    disconnected: false,
                }
            }
            Err(TryRecvError::Disconnected) => {
                return Drained {
                    latest,
                    disconnected: true,
                }
            }
        }
    }
}
