//! ClientNode - one context's view of the hub

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::CallError;
use super::handler::{OwnerHandler, Unserved};
use crate::channel::Channel;
use crate::hub::{CallFailure, ContextId, ContextMessage, HubHandle, HubMessage};

/// Client-side timeout; a little longer than the hub default so the hub's
/// own timeout normally answers first
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(35);

const BROADCAST_CAPACITY: usize = 256;

/// This context's role as last reported by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Member,
    /// Elected, `on_elected` still running
    Initializing,
    Owner,
    /// Elected, but `on_elected` failed
    Failed(String),
}

/// A broadcast received from another context
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    pub event_type: String,
    pub payload: Value,
}

type BroadcastCallback = Arc<dyn Fn(&BroadcastEvent) + Send + Sync>;
type PendingCalls = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value, CallError>>>>>;

/// Builder for [`ClientNode`]
pub struct ClientNodeBuilder {
    handler: Arc<dyn OwnerHandler>,
    callbacks: Vec<BroadcastCallback>,
    timeout: Duration,
}

impl Default for ClientNodeBuilder {
    fn default() -> Self {
        Self {
            handler: Arc::new(Unserved),
            callbacks: Vec::new(),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl ClientNodeBuilder {
    /// Handler used if this context is elected owner
    pub fn with_handler(mut self, handler: Arc<dyn OwnerHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Invoke `callback` for every broadcast received
    pub fn on_broadcast(mut self, callback: impl Fn(&BroadcastEvent) + Send + Sync + 'static) -> Self {
        self.callbacks.push(Arc::new(callback));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connect to an in-process hub
    pub async fn connect_hub(self, hub: &HubHandle) -> Result<ClientNode, CallError> {
        let channel = hub.connect().await.map_err(|_| CallError::HubClosed)?;
        self.connect(channel).await
    }

    /// Take over a channel and wait for the hub's welcome
    pub async fn connect(self, channel: Channel) -> Result<ClientNode, CallError> {
        debug!("ClientNodeBuilder::connect: called");
        let Channel { outbound, mut inbound } = channel;

        let first = tokio::time::timeout(self.timeout, inbound.recv())
            .await
            .map_err(|_| CallError::Handshake("no welcome from hub".to_string()))?;
        let context_id = match first {
            Some(HubMessage::Welcome { context_id }) => context_id,
            Some(other) => return Err(CallError::Handshake(format!("expected welcome, got {:?}", other))),
            None => return Err(CallError::HubClosed),
        };
        info!(context_id, "Connected to hub");

        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let (role_tx, role_rx) = watch::channel(Role::Member);
        let (broadcasts, _) = broadcast::channel(BROADCAST_CAPACITY);

        let reader = Arc::new(Reader {
            context_id,
            outbound: outbound.clone(),
            pending: Arc::clone(&pending),
            role: role_tx,
            broadcasts: broadcasts.clone(),
            callbacks: self.callbacks,
            handler: self.handler,
        });
        let reader_task = tokio::spawn(reader.run(inbound));

        Ok(ClientNode {
            context_id,
            outbound,
            pending,
            role: role_rx,
            broadcasts,
            timeout: self.timeout,
            reader_task,
        })
    }
}

/// A connected context
///
/// Any context may call [`ClientNode::request`]; the hub routes it to
/// whichever context currently owns the resource, possibly this one.
/// Dropping the node disconnects it.
pub struct ClientNode {
    context_id: ContextId,
    outbound: mpsc::Sender<ContextMessage>,
    pending: PendingCalls,
    role: watch::Receiver<Role>,
    broadcasts: broadcast::Sender<BroadcastEvent>,
    timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl ClientNode {
    pub fn builder() -> ClientNodeBuilder {
        ClientNodeBuilder::default()
    }

    /// Connect to an in-process hub with no owner handler
    pub async fn connect(hub: &HubHandle) -> Result<Self, CallError> {
        Self::builder().connect_hub(hub).await
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn role(&self) -> Role {
        self.role.borrow().clone()
    }

    pub fn is_owner(&self) -> bool {
        *self.role.borrow() == Role::Owner
    }

    /// Wait until this context is elected and initialised
    ///
    /// Returns an error if initialisation failed or the hub went away.
    pub async fn wait_for_ownership(&self) -> Result<(), CallError> {
        let mut role = self.role.clone();
        let settled = role
            .wait_for(|r| matches!(r, Role::Owner | Role::Failed(_)))
            .await
            .map(|r| r.clone())
            .map_err(|_| CallError::HubClosed)?;

        match settled {
            Role::Failed(reason) => Err(CallFailure::resource(reason).into()),
            _ => Ok(()),
        }
    }

    /// Send a request to the owner and wait for its result
    pub async fn request(&self, kind: &str, payload: Value) -> Result<Value, CallError> {
        let id = Uuid::now_v7().to_string();
        debug!(context_id = self.context_id, %id, %kind, "ClientNode::request: called");

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), reply_tx);

        let sent = self
            .outbound
            .send(ContextMessage::Request {
                id: id.clone(),
                kind: kind.to_string(),
                payload,
            })
            .await;
        if sent.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(CallError::HubClosed);
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::HubClosed),
            Err(_) => {
                warn!(%id, %kind, "Request timed out on client side");
                self.pending.lock().await.remove(&id);
                Err(CallError::Timeout(self.timeout))
            }
        }
    }

    /// Run SQL on the owner's store
    pub async fn exec(&self, sql: &str) -> Result<Value, CallError> {
        self.request("exec", json!({ "sql": sql })).await
    }

    /// Broadcast to every other connected context
    pub async fn broadcast(&self, event_type: &str, payload: Value) -> Result<(), CallError> {
        debug!(context_id = self.context_id, %event_type, "ClientNode::broadcast: called");
        self.outbound
            .send(ContextMessage::Broadcast {
                event_type: event_type.to_string(),
                payload,
            })
            .await
            .map_err(|_| CallError::HubClosed)
    }

    /// Receive broadcasts as a stream
    pub fn subscribe_broadcasts(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.broadcasts.subscribe()
    }

    /// Leave the hub
    pub fn disconnect(self) {
        info!(context_id = self.context_id, "Disconnecting from hub");
    }
}

impl Drop for ClientNode {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Reads hub messages for one context
struct Reader {
    context_id: ContextId,
    outbound: mpsc::Sender<ContextMessage>,
    pending: PendingCalls,
    role: watch::Sender<Role>,
    broadcasts: broadcast::Sender<BroadcastEvent>,
    callbacks: Vec<BroadcastCallback>,
    handler: Arc<dyn OwnerHandler>,
}

impl Reader {
    async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<HubMessage>) {
        while let Some(message) = inbound.recv().await {
            match message {
                HubMessage::Welcome { context_id } => {
                    warn!(context_id, "Duplicate welcome ignored");
                }
                HubMessage::ElectionNotice => self.on_election(),
                HubMessage::Request { id, kind, payload } => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.serve(id, kind, payload).await });
                }
                HubMessage::Response { id, data, error } => self.resolve(id, data, error).await,
                HubMessage::Broadcast { event_type, payload } => self.deliver(BroadcastEvent { event_type, payload }),
            }
        }

        info!(context_id = self.context_id, "Hub channel closed");
        // Dropping the senders fails every waiting request with HubClosed
        self.pending.lock().await.clear();
    }

    fn on_election(self: &Arc<Self>) {
        if *self.role.borrow() != Role::Member {
            warn!(context_id = self.context_id, "Repeated election notice ignored");
            return;
        }

        info!(context_id = self.context_id, "Elected owner, initializing");
        self.role.send_replace(Role::Initializing);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.handler.on_elected().await {
                Ok(()) => {
                    info!(context_id = this.context_id, "Owner ready");
                    this.role.send_replace(Role::Owner);
                }
                Err(e) => {
                    error!(context_id = this.context_id, error = %e, "Owner initialization failed");
                    this.role.send_replace(Role::Failed(e.to_string()));
                }
            }
        });
    }

    async fn serve(&self, id: String, kind: String, payload: Value) {
        debug!(context_id = self.context_id, %id, %kind, "Reader::serve: called");
        let mut role = self.role.subscribe();
        let Ok(ready) = role
            .wait_for(|r| *r != Role::Initializing)
            .await
            .map(|r| r.clone())
        else {
            return;
        };

        let result = match ready {
            Role::Owner => self.handler.handle(&kind, payload).await,
            Role::Failed(reason) => Err(CallFailure::resource(format!("owner initialization failed: {}", reason))),
            _ => Err(CallFailure::rejected("context is not the owner")),
        };

        let (data, error) = match result {
            Ok(value) => (Some(value), None),
            Err(failure) => {
                debug!(%id, kind = ?failure.kind, "Reader::serve: request failed");
                (None, Some(failure))
            }
        };

        if self
            .outbound
            .send(ContextMessage::Response { id, data, error })
            .await
            .is_err()
        {
            warn!(context_id = self.context_id, "Response dropped, hub channel closed");
        }
    }

    async fn resolve(&self, id: String, data: Option<Value>, error: Option<CallFailure>) {
        let Some(reply) = self.pending.lock().await.remove(&id) else {
            warn!(%id, "Response for unknown call dropped");
            return;
        };

        let result = match error {
            Some(failure) => Err(failure.into()),
            None => Ok(data.unwrap_or(Value::Null)),
        };
        let _ = reply.send(result);
    }

    fn deliver(&self, event: BroadcastEvent) {
        debug!(context_id = self.context_id, event_type = %event.event_type, "Reader::deliver: called");
        for callback in &self.callbacks {
            callback(&event);
        }
        // No subscribers is fine
        let _ = self.broadcasts.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::hub::{FailureKind, Hub, HubConfig};
    use crate::node::handler::mock::MockHandler;

    fn start(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        let hub = Hub::new(config);
        let handle = hub.handle();
        (handle, tokio::spawn(hub.run()))
    }

    async fn node(hub: &HubHandle, handler: Arc<MockHandler>) -> ClientNode {
        ClientNode::builder()
            .with_handler(handler)
            .connect_hub(hub)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_member_request_served_by_owner() {
        let (hub, task) = start(HubConfig::default());
        let owner_handler = Arc::new(MockHandler::default());
        let member_handler = Arc::new(MockHandler::default());

        let owner = node(&hub, owner_handler.clone()).await;
        owner.wait_for_ownership().await.unwrap();
        let member = node(&hub, member_handler.clone()).await;

        let result = member.request("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
        assert_eq!(owner_handler.calls(), 1);
        assert_eq!(member_handler.calls(), 0);
        assert_eq!(member_handler.inits(), 0);
        assert!(owner.is_owner());
        assert_eq!(member.role(), Role::Member);

        hub.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_waits_for_owner_initialization() {
        let (hub, task) = start(HubConfig::default());
        let handler = Arc::new(MockHandler {
            delay: Duration::from_millis(100),
            ..Default::default()
        });

        let owner = node(&hub, handler.clone()).await;
        // Issued before initialization finishes
        let result = owner.request("echo", json!("early")).await.unwrap();
        assert_eq!(result, json!("early"));
        assert_eq!(handler.inits(), 1);
        assert!(owner.is_owner());

        hub.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_initialization_reports_resource_error() {
        let (hub, task) = start(HubConfig::default());
        let handler = Arc::new(MockHandler {
            fail_init: true,
            ..Default::default()
        });

        let owner = node(&hub, handler.clone()).await;
        let err = owner.wait_for_ownership().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Resource);

        let member = node(&hub, Arc::new(MockHandler::default())).await;
        let err = member.request("echo", json!(1)).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Resource);
        assert!(err.to_string().contains("disk is read-only"));
        assert_eq!(handler.calls(), 0);

        hub.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_errors_reach_caller() {
        let (hub, task) = start(HubConfig::default());
        let owner = node(&hub, Arc::new(MockHandler::default())).await;
        owner.wait_for_ownership().await.unwrap();

        let err = owner.request("drop-table", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Rejected);

        hub.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unserved_owner_answers_no_handler() {
        let (hub, task) = start(HubConfig::default());
        let owner = ClientNode::connect(&hub).await.unwrap();
        owner.wait_for_ownership().await.unwrap();

        let err = owner.exec("SELECT 1").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::NoHandler);

        hub.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_independently() {
        let (hub, task) = start(HubConfig::default());
        let owner = node(&hub, Arc::new(MockHandler::default())).await;
        let member = Arc::new(node(&hub, Arc::new(MockHandler::default())).await);

        let mut joins = Vec::new();
        for i in 0..20 {
            let member = Arc::clone(&member);
            joins.push(tokio::spawn(async move { member.request("echo", json!(i)).await }));
        }
        for (i, join) in joins.into_iter().enumerate() {
            assert_eq!(join.await.unwrap().unwrap(), json!(i));
        }
        drop(owner);

        hub.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_callbacks_and_subscription() {
        let (hub, task) = start(HubConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);

        let sender = node(&hub, Arc::new(MockHandler::default())).await;
        let listener = ClientNode::builder()
            .on_broadcast(move |event| {
                if event.event_type == "table-changed" {
                    seen_cb.fetch_add(1, Ordering::SeqCst);
                }
            })
            .connect_hub(&hub)
            .await
            .unwrap();
        let mut rx = listener.subscribe_broadcasts();
        let mut own_rx = sender.subscribe_broadcasts();

        sender.broadcast("table-changed", json!({"table": "users"})).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload, json!({"table": "users"}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Sender is excluded
        let own = tokio::time::timeout(Duration::from_millis(50), own_rx.recv()).await;
        assert!(own.is_err());

        hub.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_owner_leaving_hands_over_ownership() {
        let (hub, task) = start(HubConfig::default());
        let first = node(&hub, Arc::new(MockHandler::default())).await;
        first.wait_for_ownership().await.unwrap();

        let second_handler = Arc::new(MockHandler::default());
        let second = node(&hub, second_handler.clone()).await;
        assert!(!second.is_owner());

        first.disconnect();
        tokio::time::timeout(Duration::from_secs(2), second.wait_for_ownership())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second_handler.inits(), 1);
        assert_eq!(second.request("echo", json!("ok")).await.unwrap(), json!("ok"));

        hub.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_context_that_stops_reading_does_not_stall_others() {
        let config = HubConfig {
            context_channel_buffer: 4,
            ..Default::default()
        };
        let capacity = config.context_buffer();
        let (hub, task) = start(config);

        let owner = node(&hub, Arc::new(MockHandler::default())).await;
        owner.wait_for_ownership().await.unwrap();
        let healthy = node(&hub, Arc::new(MockHandler::default())).await;

        // Issues calls but never reads its answers
        let mut stuck = hub.connect().await.unwrap();
        for i in 0..20 {
            stuck
                .outbound
                .send(ContextMessage::Request {
                    id: format!("s{}", i),
                    kind: "echo".to_string(),
                    payload: json!(i),
                })
                .await
                .unwrap();
        }

        let result = tokio::time::timeout(Duration::from_secs(2), healthy.request("echo", json!("alive")))
            .await
            .expect("healthy request stalled")
            .unwrap();
        assert_eq!(result, json!("alive"));

        let mut metrics = tokio::time::timeout(Duration::from_secs(2), hub.metrics())
            .await
            .expect("metrics stalled")
            .unwrap();
        for _ in 0..50 {
            if metrics.slow_disconnects == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            metrics = hub.metrics().await.unwrap();
        }
        assert_eq!(metrics.slow_disconnects, 1);
        assert_eq!(metrics.connected_contexts, 2);
        assert_eq!(metrics.owner, Some(owner.context_id()));

        // The stuck context got what fit in its buffer, then its channel closed
        let mut received = 0;
        while let Some(_msg) = tokio::time::timeout(Duration::from_secs(2), stuck.inbound.recv())
            .await
            .unwrap()
        {
            received += 1;
        }
        assert_eq!(received, capacity);

        hub.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hub_timeout_surfaces_as_timeout() {
        let config = HubConfig {
            call_timeout_ms: 100,
            ..Default::default()
        };
        let (hub, task) = start(config);

        // An owner that never answers: raw channel, no reader
        let mut silent = hub.connect().await.unwrap();
        silent.inbound.recv().await;
        let member = ClientNode::connect(&hub).await.unwrap();

        let err = member.request("echo", json!(1)).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.kind(), FailureKind::Timeout);

        hub.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_timeout_without_hub_answer() {
        let (channel, mut hub_rx, hub_tx) = Channel::pair(8);
        hub_tx.send(HubMessage::Welcome { context_id: 7 }).await.unwrap();

        let node = ClientNode::builder()
            .with_timeout(Duration::from_millis(50))
            .connect(channel)
            .await
            .unwrap();
        assert_eq!(node.context_id(), 7);

        let err = node.request("echo", json!(1)).await.unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)));
        assert!(matches!(hub_rx.recv().await, Some(ContextMessage::Request { .. })));
    }

    #[tokio::test]
    async fn test_hub_closing_fails_waiting_requests() {
        let (channel, mut hub_rx, hub_tx) = Channel::pair(8);
        hub_tx.send(HubMessage::Welcome { context_id: 1 }).await.unwrap();
        let node = ClientNode::builder().connect(channel).await.unwrap();

        let closer = tokio::spawn(async move {
            hub_rx.recv().await;
            drop(hub_tx);
        });

        let err = node.request("echo", json!(1)).await.unwrap_err();
        assert!(matches!(err, CallError::HubClosed));
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_requires_welcome() {
        let (channel, _hub_rx, hub_tx) = Channel::pair(8);
        hub_tx.send(HubMessage::ElectionNotice).await.unwrap();

        let result = ClientNode::builder().connect(channel).await;
        assert!(matches!(result, Err(CallError::Handshake(_))));
    }
}
