//! Broadcast fan-out

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::messages::{ContextId, HubMessage};
use super::registry::Registry;

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

/// Send a broadcast to every connected context, optionally skipping the sender
///
/// Delivery is best-effort: a recipient whose channel is full or closed is
/// skipped, nothing is retried or stored.
pub fn fan_out(
    registry: &Registry,
    sender: ContextId,
    event_type: &str,
    payload: &Value,
    exclude_sender: bool,
) -> FanOut {
    debug!(sender, %event_type, exclude_sender, "fan_out: called");
    let msg = HubMessage::Broadcast {
        event_type: event_type.to_string(),
        payload: payload.clone(),
    };

    let mut result = FanOut::default();
    for entry in registry.iter() {
        if exclude_sender && entry.id == sender {
            continue;
        }

        match entry.tx.try_send(msg.clone()) {
            Ok(()) => result.delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(context_id = entry.id, %event_type, "Broadcast dropped, channel full");
                result.dropped += 1;
            }
            Err(TrySendError::Closed(_)) => {
                debug!(context_id = entry.id, "Broadcast skipped, channel closed");
                result.dropped += 1;
            }
        }
    }

    result
}
