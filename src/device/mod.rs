//! Security-key devices and the backend used to drive them
//!
//! The daemon never touches input devices directly. Enumeration,
//! enable/disable and activity feeds all go through [`DeviceBackend`] so the
//! lock controller can be exercised against a mock.

mod watcher;
mod xinput;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub use watcher::DeviceWatcher;
pub use xinput::XInputBackend;

/// X input device id of an attached security key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered, duplicate-free set of attached security-key ids
///
/// Order follows enumeration order. An empty set means no key is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSet(Vec<DeviceId>);

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn ids(&self) -> &[DeviceId] {
        &self.0
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.0.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<DeviceId> for DeviceSet {
    fn from_iter<I: IntoIterator<Item = DeviceId>>(iter: I) -> Self {
        let mut ids = Vec::new();
        for id in iter {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Self(ids)
    }
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "]")
    }
}

/// Errors raised at the device-control boundary
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("device control failed for {}", format_failures(.failed))]
    Control { failed: Vec<(DeviceId, String)> },

    #[error("activity feed for device {0} has no output pipe")]
    NoOutput(DeviceId),
}

fn format_failures(failed: &[(DeviceId, String)]) -> String {
    failed
        .iter()
        .map(|(id, reason)| format!("{id} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Access to enumeration, enable/disable and activity of security keys
///
/// `enable` and `disable` must be idempotent and must treat ids that have
/// vanished as a no-op.
#[async_trait]
pub trait DeviceBackend: Send + Sync + 'static {
    /// List the currently attached security keys
    async fn enumerate(&self) -> Result<DeviceSet, DeviceError>;

    /// Enable every device in the set
    async fn enable(&self, devices: &DeviceSet) -> Result<(), DeviceError>;

    /// Disable every device in the set
    async fn disable(&self, devices: &DeviceSet) -> Result<(), DeviceError>;

    /// Open one activity feed per device and merge them
    async fn subscribe(&self, devices: &DeviceSet) -> Result<ActivityFeed, DeviceError>;
}

/// Merged line stream from one or more device activity feeds
///
/// Owns the feed subprocesses and their reader tasks. [`ActivityFeed::terminate`]
/// kills and joins them; dropping the feed still kills the children through
/// `kill_on_drop`.
pub struct ActivityFeed {
    lines: mpsc::Receiver<String>,
    children: Vec<Child>,
    readers: Vec<JoinHandle<()>>,
}

impl ActivityFeed {
    /// Feed backed by a plain channel, with no subprocesses behind it
    #[cfg(test)]
    pub fn from_channel(lines: mpsc::Receiver<String>) -> Self {
        Self {
            lines,
            children: Vec::new(),
            readers: Vec::new(),
        }
    }

    pub(crate) fn with_processes(
        lines: mpsc::Receiver<String>,
        children: Vec<Child>,
        readers: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            lines,
            children,
            readers,
        }
    }

    /// Wait for the next activity line; `None` once every feed has ended
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Kill every feed process and join its reader
    pub async fn terminate(mut self) {
        // Closing first unblocks readers parked on a full channel.
        self.lines.close();

        for child in &mut self.children {
            if let Err(e) = child.kill().await {
                debug!(?e, "activity feed process already gone");
            }
        }

        for reader in self.readers.drain(..) {
            if let Err(e) = reader.await {
                debug!(?e, "activity feed reader did not finish cleanly");
            }
        }
    }
}

impl fmt::Debug for ActivityFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityFeed")
            .field("children", &self.children.len())
            .field("readers", &self.readers.len())
            .finish()
    }
}
