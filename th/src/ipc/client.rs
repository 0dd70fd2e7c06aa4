//! IPC client for contexts in other processes

use std::path::Path;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::codec::{Frame, read_frame, write_frame};
use crate::channel::Channel;
use crate::hub::{ContextMessage, HubMessage};

/// Timeout for establishing the socket connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const CHANNEL_BUFFER: usize = 100;

/// Connect to a hub listening at `socket_path`
///
/// The returned channel behaves like one from `HubHandle::connect`: dropping
/// its `outbound` sender closes the socket, and `inbound` ends when the hub
/// closes it.
pub async fn connect(socket_path: &Path) -> Result<Channel> {
    debug!(?socket_path, "ipc::connect: called");
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(socket_path))
        .await
        .map_err(|_| eyre::eyre!("Timed out connecting to hub at {}", socket_path.display()))?
        .with_context(|| format!("Failed to connect to hub at {}", socket_path.display()))?;

    let (read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::channel::<ContextMessage>(CHANNEL_BUFFER);
    let (inbound_tx, inbound) = mpsc::channel::<HubMessage>(CHANNEL_BUFFER);

    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &msg).await {
                warn!(error = %e, "ipc::connect: hub stopped reading");
                break;
            }
        }
        debug!("ipc::connect: outbound closed");
    });

    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            match read_frame::<_, HubMessage>(&mut reader, &mut line).await {
                Ok(Frame::Message(msg)) => {
                    if inbound_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Skipped(reason)) => warn!(%reason, "Dropped message from hub"),
                Ok(Frame::Eof) => break,
                Err(e) => {
                    warn!(error = %e, "ipc::connect: read failed");
                    break;
                }
            }
        }
        debug!("ipc::connect: hub closed connection");
    });

    Ok(Channel::new(outbound, inbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_connect_missing_socket_fails() {
        let temp = TempDir::new().unwrap();
        let result = connect(&temp.path().join("missing.sock")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_decodes_hub_lines() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("hub.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        let fake_hub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_frame(&mut stream, &HubMessage::Welcome { context_id: 3 }).await.unwrap();
            write_frame(&mut stream, &HubMessage::ElectionNotice).await.unwrap();
        });

        let mut channel = connect(&socket_path).await.unwrap();
        assert_eq!(channel.inbound.recv().await, Some(HubMessage::Welcome { context_id: 3 }));
        assert_eq!(channel.inbound.recv().await, Some(HubMessage::ElectionNotice));
        fake_hub.await.unwrap();
        assert_eq!(channel.inbound.recv().await, None);
    }
}
