//! Global hotkey listener built on `xinput test-xi2 --root`
//!
//! Reads raw XI2 key events from the X server, tracks held keys and sends
//! Activate to the lock controller when the configured combo is pressed.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ComboDetector, KeyCombo, RawKeyEvent};
use crate::state::Signal;

const XI_RAW_KEY_PRESS: &str = "13";
const XI_RAW_KEY_RELEASE: &str = "14";

/// Global hotkey listener sending Activate on the command queue
pub struct HotkeyListener {
    program: String,
    combo: KeyCombo,
    command_tx: mpsc::Sender<Signal>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HotkeyListener {
    /// Create a new hotkey listener
    pub fn new(combo: KeyCombo, command_tx: mpsc::Sender<Signal>) -> Self {
        Self {
            program: "xinput".to_string(),
            combo,
            command_tx,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Start the hotkey listener
    ///
    /// Spawns the XI2 event stream and a task decoding it. The listener runs
    /// until `stop()` is called or the stream ends.
    pub fn start(&self) -> Result<(), HotkeyError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HotkeyError::AlreadyRunning);
        }

        let spawned = Command::new(&self.program)
            .args(["test-xi2", "--root"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(HotkeyError::Spawn(e));
            }
        };
        let Some(stdout) = child.stdout.take() else {
            self.running.store(false, Ordering::SeqCst);
            return Err(HotkeyError::NoOutput);
        };

        let combo = self.combo.clone();
        let command_tx = self.command_tx.clone();
        let running = Arc::clone(&self.running);

        let handle = tokio::spawn(async move {
            info!(%combo, "hotkey listener started");

            let lines = BufReader::new(stdout).lines();
            if let Err(e) = run_event_loop(lines, combo, command_tx, running.clone()).await {
                error!(?e, "hotkey listener error");
            }

            // Child is killed here at the latest, through kill_on_drop.
            drop(child);
            running.store(false, Ordering::SeqCst);
            info!("hotkey listener stopped");
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    /// Stop the hotkey listener
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    /// Check if the listener is currently running
    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Errors that can occur in the hotkey listener
#[derive(Debug, thiserror::Error)]
pub enum HotkeyError {
    #[error("hotkey listener is already running")]
    AlreadyRunning,

    #[error("failed to start xinput event stream: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("xinput event stream has no output pipe")]
    NoOutput,

    #[error("failed to read xinput event stream: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to send event to channel")]
    ChannelSend,
}

/// Decodes `xinput test-xi2` output into raw key events
///
/// Each event starts with an `EVENT type N (...)` header; the key code comes
/// a few lines later as `detail: N`.
#[derive(Debug, Default)]
pub struct Xi2Decoder {
    pending: Option<PendingKind>,
}

#[derive(Debug, Clone, Copy)]
enum PendingKind {
    Press,
    Release,
}

impl Xi2Decoder {
    pub fn feed(&mut self, line: &str) -> Option<RawKeyEvent> {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("EVENT type ") {
            self.pending = match rest.split_whitespace().next() {
                Some(XI_RAW_KEY_PRESS) => Some(PendingKind::Press),
                Some(XI_RAW_KEY_RELEASE) => Some(PendingKind::Release),
                _ => None,
            };
            return None;
        }

        let code = line.strip_prefix("detail:")?;
        let kind = self.pending.take()?;
        let code = code.trim().parse().ok()?;
        Some(match kind {
            PendingKind::Press => RawKeyEvent::Press(code),
            PendingKind::Release => RawKeyEvent::Release(code),
        })
    }
}

async fn run_event_loop<R>(
    mut lines: tokio::io::Lines<R>,
    combo: KeyCombo,
    command_tx: mpsc::Sender<Signal>,
    running: Arc<AtomicBool>,
) -> Result<(), HotkeyError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut decoder = Xi2Decoder::default();
    let mut detector = ComboDetector::new(combo);

    while running.load(Ordering::SeqCst) {
        let Some(line) = lines.next_line().await.map_err(HotkeyError::Read)? else {
            warn!("xinput event stream ended");
            break;
        };

        let Some(event) = decoder.feed(&line) else {
            continue;
        };
        if !detector.handle(event) {
            continue;
        }

        info!("key combination pressed");
        match command_tx.try_send(Signal::Activate) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("command queue full, dropping activate");
            }
            Err(TrySendError::Closed(_)) => return Err(HotkeyError::ChannelSend),
        }
    }

    Ok(())
}
