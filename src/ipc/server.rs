//! Unix domain socket server for IPC
//!
//! Provides request-response communication and push notifications of
//! indicator events to subscribed clients (the tray icon).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::events::IndicatorEvent;
use crate::state::Signal;

use super::protocol::{DaemonStatus, Notification, Request, Response, MAX_MESSAGE_LEN};

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
    events: broadcast::Sender<IndicatorEvent>,
    command_tx: mpsc::Sender<Signal>,
}

/// Shared server state
struct ServerState {
    status: DaemonStatus,
    start_time: std::time::Instant,
}

/// Everything a client handler needs
#[derive(Clone)]
struct ClientContext {
    state: Arc<RwLock<ServerState>>,
    events: broadcast::Sender<IndicatorEvent>,
    command_tx: mpsc::Sender<Signal>,
}

impl Server {
    /// Create a new IPC server
    pub fn new(
        socket_path: &Path,
        events: broadcast::Sender<IndicatorEvent>,
        command_tx: mpsc::Sender<Signal>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
                .context("failed to restrict socket permissions")?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(RwLock::new(ServerState {
            status: DaemonStatus::default(),
            start_time: std::time::Instant::now(),
        }));

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
            state,
            shutdown_tx,
            events,
            command_tx,
        })
    }

    /// Fold an indicator event into the reported status
    pub async fn apply_event(&self, event: IndicatorEvent) {
        let mut state = self.state.write().await;
        let before = state.status.lock_state;
        state.status.apply(event);

        if before != state.status.lock_state {
            debug!(
                from = ?before,
                to = ?state.status.lock_state,
                "IPC server: lock state updated"
            );
        }
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let ctx = ClientContext {
                        state: Arc::clone(&self.state),
                        events: self.events.clone(),
                        command_tx: self.command_tx.clone(),
                    };
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, ctx) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => accept_backoff(&e).await,
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(stream: UnixStream, ctx: ClientContext) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        // Frames are read on their own task so pushing a notification never
        // interrupts a half-read request.
        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(8);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("client disconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(?e, "dropping client");
                        break;
                    }
                }
            }
        });

        let mut subscription: Option<broadcast::Receiver<IndicatorEvent>> = None;

        let result = loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        break Ok(());
                    };

                    let response = match serde_json::from_slice::<Request>(&frame) {
                        Ok(request) => {
                            debug!(?request, "received request");
                            let (response, subscribe) = Self::process_request(request, &ctx).await;
                            if subscribe && subscription.is_none() {
                                subscription = Some(ctx.events.subscribe());
                                debug!("client subscribed to notifications");
                            }
                            response
                        }
                        Err(e) => Response::Error {
                            code: "bad_request".to_string(),
                            message: e.to_string(),
                        },
                    };

                    if let Err(e) = send_message(&mut writer, &response).await {
                        break Err(e);
                    }
                }

                event = next_event(&mut subscription) => match event {
                    Ok(event) => {
                        if let Err(e) = send_message(&mut writer, &Notification::Indicator { event }).await {
                            break Err(e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        subscription = None;
                    }
                },
            }
        };

        reader_task.abort();
        result
    }

    /// Process a request and return a response
    /// Returns (Response, should_subscribe)
    async fn process_request(request: Request, ctx: &ClientContext) -> (Response, bool) {
        match request {
            Request::Ping => (Response::Pong, false),

            Request::GetStatus => {
                let mut state = ctx.state.write().await;
                state.status.uptime_secs = state.start_time.elapsed().as_secs();
                (Response::Status(state.status.clone()), false)
            }

            Request::Subscribe => (Response::Subscribed, true),

            Request::Quit => {
                info!("quit requested via IPC");
                match ctx.command_tx.send(Signal::Exit).await {
                    Ok(()) => (Response::Quitting, false),
                    Err(_) => (
                        Response::Error {
                            code: "unavailable".to_string(),
                            message: "lock controller is not running".to_string(),
                        },
                        false,
                    ),
                }
            }
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Read one length-prefixed frame; `None` on a clean disconnect
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        bail!("message too large ({len} bytes)");
    }

    let mut msg_buf = vec![0u8; len];
    reader
        .read_exact(&mut msg_buf)
        .await
        .context("truncated message")?;
    Ok(Some(msg_buf))
}

/// Send a length-prefixed JSON message
async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let msg_bytes = serde_json::to_vec(msg)?;
    let msg_len = u32::try_from(msg_bytes.len())
        .context("message too large")?
        .to_le_bytes();

    writer.write_all(&msg_len).await?;
    writer.write_all(&msg_bytes).await?;

    Ok(())
}

/// Log a failed accept and wait before the next one; persistent errors such
/// as EMFILE would otherwise spin the accept loop
async fn accept_backoff(e: &std::io::Error) {
    error!(?e, "accept error, backing off");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn next_event(
    subscription: &mut Option<broadcast::Receiver<IndicatorEvent>>,
) -> Result<IndicatorEvent, broadcast::error::RecvError> {
    match subscription {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
