//! A context's two-way link to the hub

use tokio::sync::mpsc;

use crate::hub::{ContextMessage, HubMessage};

/// Message channel between one context and the hub
///
/// Dropping `outbound` is how a context disconnects. `inbound` returns None
/// once the hub has gone away.
#[derive(Debug)]
pub struct Channel {
    pub outbound: mpsc::Sender<ContextMessage>,
    pub inbound: mpsc::Receiver<HubMessage>,
}

impl Channel {
    pub fn new(outbound: mpsc::Sender<ContextMessage>, inbound: mpsc::Receiver<HubMessage>) -> Self {
        Self { outbound, inbound }
    }

    /// A connected pair of channels, one for each end
    ///
    /// The far end sees messages from the near end's `outbound` as
    /// `ContextMessage`s and answers with `HubMessage`s. Used to stand in for
    /// the hub in tests.
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<ContextMessage>, mpsc::Sender<HubMessage>) {
        let (outbound, far_rx) = mpsc::channel(buffer);
        let (far_tx, inbound) = mpsc::channel(buffer);
        (Self { outbound, inbound }, far_rx, far_tx)
    }
}
