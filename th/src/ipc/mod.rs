//! Inter-Process Communication for contexts in other processes
//!
//! Contexts outside the hub's process connect over a Unix Domain Socket.
//! Each line on the socket is one JSON-encoded `ContextMessage` (client to
//! hub) or `HubMessage` (hub to client).

use std::path::PathBuf;

pub mod client;
pub mod codec;
pub mod listener;

pub use client::connect;
pub use listener::{cleanup_socket, create_listener, create_listener_at, serve};

/// Get the default socket path for the hub
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("tabhub")
        .join("hub.sock")
}
