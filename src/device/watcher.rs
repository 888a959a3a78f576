//! Presence polling for attached security keys
//!
//! Enumerates devices on a fixed interval, publishes the new set whenever
//! it changes and flips the indicator between present and absent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{DeviceBackend, DeviceSet};
use crate::events::IndicatorEvent;
use crate::state::Signal;

/// Polls the device backend and reports changes in the attached key set
pub struct DeviceWatcher {
    backend: Arc<dyn DeviceBackend>,
    poll_interval: Duration,
    device_tx: mpsc::Sender<Signal>,
    indicator_tx: broadcast::Sender<IndicatorEvent>,
    /// Last set the controller accepted
    published: DeviceSet,
    key_present: bool,
    failing: bool,
}

impl DeviceWatcher {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        poll_interval: Duration,
        device_tx: mpsc::Sender<Signal>,
        indicator_tx: broadcast::Sender<IndicatorEvent>,
    ) -> Self {
        Self {
            backend,
            poll_interval,
            device_tx,
            indicator_tx,
            published: DeviceSet::new(),
            key_present: false,
            failing: false,
        }
    }

    /// Poll forever; returns only once the controller is gone
    pub async fn run(mut self) {
        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            "device watcher started"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.device_tx.is_closed() {
                break;
            }
            self.poll_once().await;
        }

        info!("device watcher stopped");
    }

    async fn poll_once(&mut self) {
        let current = match self.backend.enumerate().await {
            Ok(devices) => {
                if self.failing {
                    info!("device enumeration recovered");
                    self.failing = false;
                }
                devices
            }
            Err(e) => {
                if self.failing {
                    debug!(error = %e, "device enumeration still failing");
                } else {
                    warn!(error = %e, "device enumeration failed, treating as no key");
                    self.failing = true;
                }
                DeviceSet::new()
            }
        };

        self.update_presence(&current);

        if current != self.published {
            match self.device_tx.try_send(Signal::DeviceSetChanged(current.clone())) {
                Ok(()) => {
                    info!(devices = %current, "security key set changed");
                    self.published = current;
                }
                Err(TrySendError::Full(_)) => {
                    debug!("device queue full, retrying next tick");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("device queue closed");
                }
            }
        }
    }

    fn update_presence(&mut self, current: &DeviceSet) {
        let event = match (self.key_present, current.is_empty()) {
            (false, false) => IndicatorEvent::KeyPresent,
            (true, true) => IndicatorEvent::KeyAbsent,
            _ => return,
        };

        self.key_present = !current.is_empty();
        info!(%event, "security key presence changed");
        // No subscribers is fine; the indicator may not be up yet.
        let _ = self.indicator_tx.send(event);
    }
}
