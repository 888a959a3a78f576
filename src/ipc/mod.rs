//! IPC module for daemon-tray communication
//!
//! Status displays connect to a local Unix socket to query the lock state,
//! subscribe to indicator events, or ask the daemon to quit.

mod protocol;
mod server;

pub use server::Server;
