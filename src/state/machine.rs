//! Lock controller state machine
//!
//! Reconciles device presence, hotkey activation and unlock-session
//! outcomes into a single lock/unlock decision:
//!
//! Uninitialized -> Locked (first nonempty device set) -> Unlocked (Activate)
//! -> Locked (session end) -> ... and Exiting (Exit, terminal).
//!
//! The controller runs on a short fixed tick. Each tick drains its queues
//! keeping only the newest value, and an unlock session is awaited inline so
//! no other signal is looked at until it ends.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::signal::{drain_latest, Signal};
use crate::config::Config;
use crate::device::{DeviceBackend, DeviceSet};
use crate::events::IndicatorEvent;
use crate::session::{SessionConfig, SessionMonitor};

/// Lock state of the attached security keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    /// No key has been seen yet
    #[default]
    Uninitialized,
    /// Keys are disabled
    Locked,
    /// Keys are enabled for an unlock session
    Unlocked,
    /// Keys were re-enabled for shutdown
    Exiting,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockState::Uninitialized => write!(f, "Uninitialized"),
            LockState::Locked => write!(f, "Locked"),
            LockState::Unlocked => write!(f, "Unlocked"),
            LockState::Exiting => write!(f, "Exiting"),
        }
    }
}

/// Owns the lock state and the current device set
pub struct LockController {
    state: LockState,
    /// `None` until the watcher has reported anything
    devices: Option<DeviceSet>,
    /// Set once keys have been disabled at least once
    initial_locked: bool,
    backend: Arc<dyn DeviceBackend>,
    session: SessionConfig,
    tick_interval: Duration,
    device_rx: mpsc::Receiver<Signal>,
    command_rx: mpsc::Receiver<Signal>,
    indicator_tx: broadcast::Sender<IndicatorEvent>,
}

impl LockController {
    pub fn new(
        config: &Config,
        backend: Arc<dyn DeviceBackend>,
        device_rx: mpsc::Receiver<Signal>,
        command_rx: mpsc::Receiver<Signal>,
        indicator_tx: broadcast::Sender<IndicatorEvent>,
    ) -> Self {
        Self {
            state: LockState::Uninitialized,
            devices: None,
            initial_locked: false,
            backend,
            session: config.session(),
            tick_interval: config.tick_interval,
            device_rx,
            command_rx,
            indicator_tx,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> LockState {
        self.state
    }

    #[cfg(test)]
    pub fn devices(&self) -> Option<&DeviceSet> {
        self.devices.as_ref()
    }

    /// Tick until Exit; returns the final state
    pub async fn run(mut self) -> LockState {
        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            timeout_secs = self.session.timeout.as_secs_f64(),
            "lock controller started"
        );

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.tick().await.is_break() {
                break;
            }
        }

        info!(state = %self.state, "lock controller stopped");
        self.state
    }

    /// One pass over the queues
    async fn tick(&mut self) -> ControlFlow<()> {
        if let Some(set) = self.take_device_set() {
            self.devices = Some(set);
        }

        let signal = self.take_command();

        let Some(devices) = self.devices.clone() else {
            if signal == Some(Signal::Exit) {
                info!("exit requested before any security key was seen");
                self.state = LockState::Exiting;
                return ControlFlow::Break(());
            }
            return ControlFlow::Continue(());
        };

        match signal {
            Some(Signal::Exit) => {
                self.shutdown(&devices).await;
                return ControlFlow::Break(());
            }
            Some(Signal::Activate) if !devices.is_empty() => {
                self.unlock_cycle(&devices).await;
            }
            Some(Signal::Activate) => {
                debug!("activate ignored, no security key attached");
            }
            Some(other) => {
                debug!(signal = ?other, "ignoring unexpected command signal");
            }
            None if !self.initial_locked && !devices.is_empty() => {
                info!(devices = %devices, "security key detected, applying initial lock");
                self.lock(&devices).await;
            }
            None => {}
        }

        ControlFlow::Continue(())
    }

    fn take_device_set(&mut self) -> Option<DeviceSet> {
        let drained = drain_latest(&mut self.device_rx);
        match drained.latest {
            Some(Signal::DeviceSetChanged(set)) => {
                debug!(devices = %set, "device set updated");
                Some(set)
            }
            Some(other) => {
                warn!(signal = ?other, "unexpected signal on device queue");
                None
            }
            None => None,
        }
    }

    /// Coalesce the command queue
    ///
    /// Keeps the newest signal, except that an Exit anywhere in the batch
    /// wins. A closed queue also means Exit.
    fn take_command(&mut self) -> Option<Signal> {
        let mut latest = None;
        let mut exit = false;
        let disconnected = loop {
            match self.command_rx.try_recv() {
                Ok(Signal::Exit) => exit = true,
                Ok(signal) => latest = Some(signal),
                Err(TryRecvError::Empty) => break false,
                Err(TryRecvError::Disconnected) => break true,
            }
        };

        if disconnected && !exit {
            warn!("command queue closed, shutting down");
            exit = true;
        }

        if exit {
            Some(Signal::Exit)
        } else {
            latest
        }
    }

    /// Unlock, hold a session, relock
    async fn unlock_cycle(&mut self, devices: &DeviceSet) {
        info!(devices = %devices, "unlocking security keys");
        if let Err(e) = self.backend.enable(devices).await {
            error!(devices = %devices, error = %e, "failed to enable security keys");
        }
        self.state = LockState::Unlocked;
        self.publish(IndicatorEvent::Unlocked);

        let (relock_tx, relock_rx) = oneshot::channel();
        let monitor = SessionMonitor::new(Arc::clone(&self.backend), devices.clone(), self.session);
        let session = tokio::spawn(monitor.run(relock_tx));

        let outcome = relock_rx.await.unwrap_or_else(|_| {
            warn!("unlock session ended without an outcome");
            Signal::RelockTimeout
        });
        if let Err(e) = session.await {
            error!(?e, "unlock session task failed");
        }
        debug!(?outcome, "unlock session finished");

        self.lock(devices).await;
    }

    async fn lock(&mut self, devices: &DeviceSet) {
        if let Err(e) = self.backend.disable(devices).await {
            error!(devices = %devices, error = %e, "failed to disable security keys");
        }
        info!(devices = %devices, "security keys locked");
        self.state = LockState::Locked;
        self.initial_locked = true;
        self.publish(IndicatorEvent::Locked);
    }

    async fn shutdown(&mut self, devices: &DeviceSet) {
        info!(devices = %devices, "exiting, re-enabling security keys");
        if let Err(e) = self.backend.enable(devices).await {
            error!(devices = %devices, error = %e, "failed to re-enable security keys on exit");
        }
        self.state = LockState::Exiting;
        self.publish(IndicatorEvent::Unlocked);
    }

    fn publish(&self, event: IndicatorEvent) {
        debug!(%event, "publishing indicator event");
        let _ = self.indicator_tx.send(event);
    }
}
