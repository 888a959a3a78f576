//! Wire types for the keylock control socket
//!
//! Every frame is a 4-byte little-endian length followed by that many bytes
//! of JSON.

use serde::{Deserialize, Serialize};

use crate::events::IndicatorEvent;

/// Largest message either side accepts
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Lock state as reported to status displays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No lock or unlock has happened yet
    #[default]
    Unknown,
    Locked,
    Unlocked,
}

/// Requests from a status display to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Lock state and key presence snapshot
    GetStatus,

    /// Liveness check
    Ping,

    /// Subscribe to indicator notifications
    Subscribe,

    /// Re-enable keys and shut the daemon down
    Quit,
}

/// Responses from daemon to a status display
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Reply to `get_status`
    Status(DaemonStatus),

    /// Reply to `ping`
    Pong,

    /// Indicator notifications follow on this connection
    Subscribed,

    /// Shutdown has been requested
    Quitting,

    /// Request could not be served
    Error { code: String, message: String },
}

/// Push notification for subscribed clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Indicator { event: IndicatorEvent },
}

/// What the tray shows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Crate version of the running daemon
    pub version: String,

    /// Current lock state
    pub lock_state: LockMode,

    /// Whether a security key is attached
    pub key_present: bool,

    /// Seconds since the socket was opened
    pub uptime_secs: u64,
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            lock_state: LockMode::default(),
            key_present: false,
            uptime_secs: 0,
        }
    }
}

impl DaemonStatus {
    /// Fold an indicator event into the snapshot
    pub fn apply(&mut self, event: IndicatorEvent) {
        match event {
            IndicatorEvent::KeyPresent => self.key_present = true,
            IndicatorEvent::KeyAbsent => self.key_present = false,
            IndicatorEvent::Unlocked => self.lock_state = LockMode::Unlocked,
            IndicatorEvent::Locked => self.lock_state = LockMode::Locked,
        }
    }
}
