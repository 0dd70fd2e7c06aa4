//! JSON-lines framing

use eyre::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum size of one line on the socket
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// One read from the socket
#[derive(Debug)]
pub enum Frame<M> {
    Message(M),
    /// A line that was too large or did not parse; the connection survives
    Skipped(String),
    Eof,
}

/// Read the next line and decode it
///
/// `line` is a scratch buffer reused between calls.
pub async fn read_frame<R, M>(reader: &mut R, line: &mut String) -> Result<Frame<M>>
where
    R: AsyncBufRead + Unpin,
    M: DeserializeOwned,
{
    line.clear();
    let bytes_read = reader.read_line(line).await.context("Failed to read IPC message")?;

    if bytes_read == 0 {
        return Ok(Frame::Eof);
    }
    if bytes_read > MAX_MESSAGE_SIZE {
        return Ok(Frame::Skipped(format!("message too large: {} bytes", bytes_read)));
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Frame::Skipped("empty line".to_string()));
    }

    match serde_json::from_str(trimmed) {
        Ok(msg) => Ok(Frame::Message(msg)),
        Err(e) => Ok(Frame::Skipped(format!("malformed message: {}", e))),
    }
}

/// Encode a message as one line and flush it
pub async fn write_frame<W, M>(writer: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut json = serde_json::to_string(msg).context("Failed to serialize message")?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .context("Failed to write message")?;
    writer.flush().await.context("Failed to flush message")?;
    debug!(bytes = json.len(), "write_frame: sent");
    Ok(())
}
