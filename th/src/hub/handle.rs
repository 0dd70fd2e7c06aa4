//! HubHandle - Client interface for talking to a running Hub

use eyre::{Result, eyre};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::messages::{ContextId, ContextMessage, HubMessage, HubMetrics, HubRequest};
use crate::channel::Channel;

/// Handle for connecting contexts and controlling the Hub
///
/// This handle is cloneable. Every in-process context and every socket
/// bridge holds one.
#[derive(Clone)]
pub struct HubHandle {
    /// Sender to the Hub task
    tx: mpsc::Sender<HubRequest>,

    /// Buffer size for channels created by `connect`
    context_buffer: usize,
}

impl HubHandle {
    pub(crate) fn new(tx: mpsc::Sender<HubRequest>, context_buffer: usize) -> Self {
        debug!(context_buffer, "HubHandle::new: called");
        Self { tx, context_buffer }
    }

    /// Connect an in-process context
    ///
    /// The returned channel's first inbound message is the Welcome. Dropping
    /// its `outbound` sender disconnects the context.
    pub async fn connect(&self) -> Result<Channel> {
        debug!("HubHandle::connect: called");
        let (hub_tx, inbound) = mpsc::channel(self.context_buffer);
        let context_id = self.attach(hub_tx).await?;

        let (outbound, mut outbound_rx) = mpsc::channel::<ContextMessage>(self.context_buffer);
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if hub.inbound(context_id, message).await.is_err() {
                    debug!(context_id, "HubHandle::connect: hub gone, stopping pump");
                    return;
                }
            }
            let _ = hub.detach(context_id).await;
        });

        Ok(Channel::new(outbound, inbound))
    }

    /// Register a raw sender and return the context id assigned to it
    ///
    /// The caller is responsible for feeding the context's messages through
    /// [`HubHandle::inbound`] and for calling [`HubHandle::detach`].
    pub async fn attach(&self, tx: mpsc::Sender<HubMessage>) -> Result<ContextId> {
        debug!("HubHandle::attach: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HubRequest::Connect { tx, reply: reply_tx })
            .await
            .map_err(|_| eyre!("Hub channel closed"))?;

        reply_rx.await.map_err(|_| eyre!("Hub dropped connect request"))
    }

    /// Deliver a message from a context
    pub async fn inbound(&self, from: ContextId, message: ContextMessage) -> Result<()> {
        debug!(from, "HubHandle::inbound: called");
        self.tx
            .send(HubRequest::Inbound { from, message })
            .await
            .map_err(|_| eyre!("Hub channel closed"))
    }

    /// Disconnect a context
    pub async fn detach(&self, context_id: ContextId) -> Result<()> {
        debug!(context_id, "HubHandle::detach: called");
        self.tx
            .send(HubRequest::Disconnect { context_id })
            .await
            .map_err(|_| eyre!("Hub channel closed"))
    }

    /// Change how many routed calls may be in flight
    pub async fn set_max_concurrency(&self, max: usize) -> Result<()> {
        debug!(max, "HubHandle::set_max_concurrency: called");
        self.tx
            .send(HubRequest::SetMaxConcurrency { max })
            .await
            .map_err(|_| eyre!("Hub channel closed"))
    }

    /// Get Hub metrics
    pub async fn metrics(&self) -> Result<HubMetrics> {
        debug!("HubHandle::metrics: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HubRequest::GetMetrics { reply: reply_tx })
            .await
            .map_err(|_| eyre!("Hub channel closed"))?;

        reply_rx.await.map_err(|_| eyre!("Failed to receive metrics"))
    }

    /// Request Hub shutdown
    pub async fn shutdown(&self) -> Result<()> {
        debug!("HubHandle::shutdown: called");
        self.tx
            .send(HubRequest::Shutdown)
            .await
            .map_err(|_| eyre!("Hub channel closed"))
    }

    /// Buffer size for per-context channels
    pub fn context_buffer(&self) -> usize {
        self.context_buffer
    }

    /// Whether the Hub task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
