//! Log (and optionally desktop-notify) every indicator event

use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::IndicatorEvent;

const NOTIFY_PROGRAM: &str = "notify-send";
const KEY_DETECTED_MESSAGE: &str = "YubiKey(s) detected.";

/// Consumes the indicator channel on behalf of status displays
#[derive(Debug, Clone)]
pub struct IndicatorNotifier {
    desktop_notifications: bool,
}

impl IndicatorNotifier {
    pub fn new(desktop_notifications: bool) -> Self {
        Self {
            desktop_notifications,
        }
    }

    /// Run until the channel closes
    pub async fn run(self, mut events: broadcast::Receiver<IndicatorEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "indicator receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("indicator notifier stopped");
    }

    async fn handle(&self, event: IndicatorEvent) {
        info!(%event, "indicator");

        if self.desktop_notifications && event == IndicatorEvent::KeyPresent {
            let spawned = Command::new(NOTIFY_PROGRAM)
                .args(["--expire-time=2000", KEY_DETECTED_MESSAGE])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = spawned {
                warn!(?e, "desktop notification failed");
            }
        }
    }
}
