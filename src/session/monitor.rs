//! Bounded unlock window watching for security-key activity
//!
//! A session opens the activity feeds of the unlocked keys and waits for
//! either a line of activity (the key was used) or the deadline. Either way
//! it reports back so the controller relocks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::device::{ActivityFeed, DeviceBackend, DeviceSet};
use crate::state::Signal;

/// Timing of an unlock session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long keys stay unlocked without activity
    pub timeout: Duration,
    /// Quiet period that ends an activity burst
    pub debounce: Duration,
}

/// One unlock window over a fixed device set
pub struct SessionMonitor {
    backend: Arc<dyn DeviceBackend>,
    devices: DeviceSet,
    config: SessionConfig,
}

impl SessionMonitor {
    pub fn new(backend: Arc<dyn DeviceBackend>, devices: DeviceSet, config: SessionConfig) -> Self {
        Self {
            backend,
            devices,
            config,
        }
    }

    /// Watch the session and report its outcome on the relock channel
    pub async fn run(self, relock_tx: oneshot::Sender<Signal>) {
        let outcome = self.watch().await;
        if relock_tx.send(outcome).is_err() {
            warn!("relock receiver dropped before session ended");
        }
    }

    /// Returns `RelockTriggered` on activity and `RelockTimeout` otherwise
    pub async fn watch(&self) -> Signal {
        let Some(deadline) = Instant::now().checked_add(self.config.timeout) else {
            error!(
                timeout_secs = self.config.timeout.as_secs_f64(),
                "unlock timeout out of range, relocking"
            );
            return Signal::RelockTimeout;
        };

        let mut feed = match self.backend.subscribe(&self.devices).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(devices = %self.devices, error = %e, "activity feed unavailable, relocking");
                return Signal::RelockTimeout;
            }
        };

        let outcome = self.observe(&mut feed, deadline).await;
        feed.terminate().await;
        debug!(devices = %self.devices, "activity feeds closed");
        outcome
    }

    async fn observe(&self, feed: &mut ActivityFeed, deadline: Instant) -> Signal {
        tokio::select! {
            line = feed.next_line() => match line {
                Some(line) => debug!(%line, "security key activity"),
                None => {
                    warn!(devices = %self.devices, "activity feed ended early, relocking");
                    return Signal::RelockTimeout;
                }
            },
            _ = sleep_until(deadline) => {
                info!(
                    timeout_secs = self.config.timeout.as_secs_f64(),
                    "unlock session timed out"
                );
                return Signal::RelockTimeout;
            }
        }

        // Swallow the rest of the burst (an OTP is one line per key event).
        let mut drained = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = sleep_until(deadline) => break,
                next = timeout(self.config.debounce, feed.next_line()) => match next {
                    Ok(Some(_)) => drained += 1,
                    Ok(None) | Err(_) => break,
                },
            }
        }

        info!(drained, "security key used, relocking");
        Signal::RelockTriggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{devices, Call, MockBackend};
    use tokio::sync::mpsc;

    const CONFIG: SessionConfig = SessionConfig {
        timeout: Duration::from_secs(3),
        debounce: Duration::from_millis(10),
    };

    fn monitor(backend: &Arc<MockBackend>) -> SessionMonitor {
        SessionMonitor::new(backend.clone(), devices(&[5, 6]), CONFIG)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_activity() {
        let backend = Arc::new(MockBackend::new());
        let started = Instant::now();

        let outcome = monitor(&backend).watch().await;

        let elapsed = started.elapsed();
        assert_eq!(outcome, Signal::RelockTimeout);
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed <= Duration::from_secs(3) + Duration::from_millis(10));
        assert_eq!(backend.calls(), vec![Call::Subscribe(devices(&[5, 6]))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_activity_line_relocks_before_deadline() {
        let backend = Arc::new(MockBackend::new());
        let (tx, rx) = mpsc::channel(8);
        backend.push_feed(rx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = tx.send("key press   36".to_string()).await;
            // Keep the feed open so only the debounce ends the burst.
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let started = Instant::now();

        let outcome = monitor(&backend).watch().await;

        assert_eq!(outcome, Signal::RelockTriggered);
        assert!(started.elapsed() < CONFIG.timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_drained_before_reporting() {
        let backend = Arc::new(MockBackend::new());
        let (tx, rx) = mpsc::channel(64);
        for i in 0..44 {
            tx.send(format!("key press {i}")).await.unwrap();
        }
        backend.push_feed(rx);
        let started = Instant::now();

        let session = monitor(&backend);
        let outcome = session.watch().await;

        assert_eq!(outcome, Signal::RelockTriggered);
        assert!(started.elapsed() < Duration::from_millis(100));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_ending_early_counts_as_timeout() {
        let backend = Arc::new(MockBackend::new());
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(tx);
        backend.push_feed(rx);
        let started = Instant::now();

        let outcome = monitor(&backend).watch().await;

        assert_eq!(outcome, Signal::RelockTimeout);
        assert!(started.elapsed() < CONFIG.timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_counts_as_timeout() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_subscribe();

        let outcome = monitor(&backend).watch().await;

        assert_eq!(outcome, Signal::RelockTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_deadline_relocks_without_subscribing() {
        let backend = Arc::new(MockBackend::new());
        let config = SessionConfig {
            timeout: Duration::MAX,
            ..CONFIG
        };

        let outcome = SessionMonitor::new(backend.clone(), devices(&[5]), config)
            .watch()
            .await;

        assert_eq!(outcome, Signal::RelockTimeout);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_on_relock_channel() {
        let backend = Arc::new(MockBackend::new());
        let (relock_tx, relock_rx) = oneshot::channel();

        tokio::spawn(monitor(&backend).run(relock_tx));

        assert_eq!(relock_rx.await.unwrap(), Signal::RelockTimeout);
    }
}
