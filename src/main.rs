//! keylock: keeps a security-key input device disabled until unlocked
//!
//! A security key that types OTPs when touched is a liability while it sits
//! in the port. This daemon:
//! - Disables the key as soon as it is plugged in
//! - Enables it when the unlock hotkey is pressed
//! - Disables it again after the key is used or a timeout passes
//! - Re-enables it on shutdown so it is never left unusable
//!
//! Devices are driven through X11 `xinput`; a local IPC socket serves the
//! tray indicator.

mod config;
mod device;
mod events;
mod hotkey;
mod ipc;
mod lifecycle;
mod session;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::device::{DeviceBackend, DeviceWatcher, XInputBackend};
use crate::events::{IndicatorEvent, IndicatorNotifier};
use crate::hotkey::HotkeyListener;
use crate::ipc::Server;
use crate::lifecycle::{reenable_attached, ShutdownSignal};
use crate::state::{LockController, Signal, SIGNAL_QUEUE_CAPACITY};

/// Capacity of the indicator broadcast channel
const INDICATOR_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "keylock starting");

    // Configuration problems abort before any device is touched
    let config = Config::load().context("invalid configuration")?;
    info!(
        timeout_secs = config.timeout.as_secs_f64(),
        combo = %config.combo,
        socket = ?config.socket_path,
        "configuration loaded"
    );

    let mut shutdown = ShutdownSignal::new().context("failed to register signal handlers")?;

    // Create channels for inter-component communication
    // Device watcher -> lock controller
    let (device_tx, device_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
    // Hotkey listener, IPC and shutdown -> lock controller
    let (command_tx, command_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
    // Lock controller and watcher -> indicator consumers
    let (indicator_tx, _indicator_rx) = broadcast::channel::<IndicatorEvent>(INDICATOR_CAPACITY);

    let backend: Arc<dyn DeviceBackend> =
        Arc::new(XInputBackend::new(config.device_pattern.clone()));

    let controller = LockController::new(
        &config,
        Arc::clone(&backend),
        device_rx,
        command_rx,
        indicator_tx.clone(),
    );
    let watcher = DeviceWatcher::new(
        Arc::clone(&backend),
        config.poll_interval,
        device_tx,
        indicator_tx.clone(),
    );
    let notifier = IndicatorNotifier::new(config.desktop_notifications);

    let notifier_task = tokio::spawn(notifier.run(indicator_tx.subscribe()));
    let mut controller_task = tokio::spawn(controller.run());
    let watcher_task = tokio::spawn(watcher.run());

    let hotkey_listener = HotkeyListener::new(config.combo.clone(), command_tx.clone());
    match hotkey_listener.start() {
        Ok(()) => {
            info!("hotkey listener started");
        }
        Err(e) => {
            error!(?e, "failed to start hotkey listener");
            warn!("continuing without hotkey support - is an X session available?");
        }
    }

    let server = if config.ipc_enabled {
        match Server::new(&config.socket_path, indicator_tx.clone(), command_tx.clone()) {
            Ok(server) => Some(server),
            Err(e) => {
                error!(?e, "failed to start IPC server");
                warn!("continuing without IPC");
                None
            }
        }
    } else {
        None
    };
    let mut ipc_event_rx = indicator_tx.subscribe();

    info!("daemon initialized, entering main loop");

    // Main event loop
    let finished = tokio::select! {
        // The controller only stops on its own after an IPC quit
        result = &mut controller_task => Some(result),

        _ = serve_ipc(server.as_ref(), &mut ipc_event_rx) => None,

        _ = shutdown.wait() => {
            info!("shutdown signal received");
            None
        }
    };

    let finished = match finished {
        Some(result) => result,
        None => {
            info!("requesting exit; an active unlock session finishes first");
            if command_tx.send(Signal::Exit).await.is_err() {
                warn!("lock controller already stopped");
            }
            controller_task.await
        }
    };

    let outcome = match finished {
        Ok(state) => {
            info!(%state, "lock controller finished");
            Ok(())
        }
        Err(e) => {
            error!(?e, "lock controller failed, re-enabling attached keys");
            reenable_attached(backend.as_ref())
                .await
                .map(|_| ())
                .context("fail-safe re-enable failed")
        }
    };

    // Cleanup
    info!("shutting down...");

    hotkey_listener.stop();
    watcher_task.abort();
    if let Some(server) = &server {
        server.shutdown().await;
    }
    notifier_task.abort();

    info!("keylock stopped");

    outcome
}

/// Serve IPC clients and keep the reported status in sync
///
/// Never completes; without a server it just waits.
async fn serve_ipc(server: Option<&Server>, events: &mut broadcast::Receiver<IndicatorEvent>) {
    let Some(server) = server else {
        return std::future::pending().await;
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        _ = async {
            loop {
                match events.recv().await {
                    Ok(event) => server.apply_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "indicator receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("indicator event handler exited");
        }
    }

    std::future::pending().await
}
