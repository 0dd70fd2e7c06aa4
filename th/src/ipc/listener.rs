//! IPC listener for the hub side
//!
//! Accepts socket connections and bridges each one into the hub as a context.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::codec::{Frame, read_frame, write_frame};
use super::get_socket_path;
use crate::hub::{ContextMessage, HubHandle, HubMessage};

/// Create and bind a listener at the default socket path
pub fn create_listener() -> Result<(UnixListener, PathBuf)> {
    let socket_path = get_socket_path();
    create_listener_at(&socket_path)
}

/// Create a listener at a specific path
///
/// Creates missing parent directories and replaces a stale socket file left
/// behind by a previous run.
pub fn create_listener_at(socket_path: &Path) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener: creating IPC socket");

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    if socket_path.exists() {
        debug!(?socket_path, "create_listener: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind IPC socket")?;
    debug!(?socket_path, "create_listener: socket bound successfully");

    Ok((listener, socket_path.to_path_buf()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Accept connections until the hub stops
pub async fn serve(listener: UnixListener, hub: HubHandle) -> Result<()> {
    info!("IPC listener accepting connections");
    loop {
        let (stream, _) = listener.accept().await.context("Failed to accept IPC connection")?;
        if hub.is_closed() {
            debug!("serve: hub stopped, no longer accepting");
            return Ok(());
        }

        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge(stream, hub).await {
                warn!(error = %e, "IPC connection ended with error");
            }
        });
    }
}

/// Run one socket connection as a hub context
///
/// Returns when the peer closes the socket or the hub stops. Lines that do
/// not decode are logged and skipped.
pub async fn bridge(stream: UnixStream, hub: HubHandle) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::channel::<HubMessage>(hub.context_buffer());
    let context_id = hub.attach(tx).await?;
    info!(context_id, "IPC context connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &msg).await {
                debug!(context_id, error = %e, "bridge: peer stopped reading");
                break;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let result = loop {
        match read_frame::<_, ContextMessage>(&mut reader, &mut line).await {
            Ok(Frame::Message(msg)) => {
                if hub.inbound(context_id, msg).await.is_err() {
                    break Ok(());
                }
            }
            Ok(Frame::Skipped(reason)) => warn!(context_id, %reason, "Dropped IPC message"),
            Ok(Frame::Eof) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    let _ = hub.detach(context_id).await;
    writer.abort();
    info!(context_id, "IPC context disconnected");
    result
}
