//! Main Hub task implementation

use std::collections::HashMap;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::broadcast::fan_out;
use super::config::HubConfig;
use super::handle::HubHandle;
use super::messages::{CallFailure, ContextId, ContextMessage, FailureKind, HubMessage, HubMetrics, HubRequest, RouteId};
use super::registry::Registry;
use super::router::{RoutingMiss, Router};
use crate::queue::{Activation, EventQueue};

/// The Hub is the coordination process every context connects to
///
/// It owns the registry, the router and the admission queue. All of them are
/// mutated only from [`Hub::run`], one request at a time.
pub struct Hub {
    config: HubConfig,
    tx: mpsc::Sender<HubRequest>,
    rx: mpsc::Receiver<HubRequest>,
}

impl Hub {
    /// Create a new Hub with the given configuration
    pub fn new(config: HubConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer);
        Self { config, tx, rx }
    }

    /// Get a sender for raw requests
    pub fn sender(&self) -> mpsc::Sender<HubRequest> {
        self.tx.clone()
    }

    /// Create a handle for connecting contexts and controlling the hub
    pub fn handle(&self) -> HubHandle {
        HubHandle::new(self.tx.clone(), self.config.context_buffer())
    }

    /// Run the Hub task
    ///
    /// This consumes the Hub and runs until shutdown is requested.
    pub async fn run(mut self) {
        let queue: EventQueue<RouteId> = EventQueue::matching_eq(self.config.queue_config());
        match queue.subscribe().await {
            Some(rx) => spawn_activation_bridge(queue.clone(), rx, self.tx.clone()),
            None => warn!("Hub: admission queue unavailable at startup"),
        }

        let mut state = HubState {
            config: self.config.clone(),
            hub_tx: self.tx.clone(),
            registry: Registry::new(),
            router: Router::new(),
            queue,
            timers: HashMap::new(),
            dead: Vec::new(),
            metrics: HubMetrics::default(),
        };

        info!(max_concurrency = self.config.max_concurrency, "Hub started");

        while let Some(req) = self.rx.recv().await {
            match req {
                HubRequest::Connect { tx, reply } => state.on_connect(tx, reply).await,

                HubRequest::Disconnect { context_id } => {
                    state.on_disconnect(context_id).await;
                    state.elect_owner().await;
                }

                HubRequest::Inbound { from, message } => {
                    state.metrics.messages_received += 1;
                    state.on_inbound(from, message).await;
                }

                HubRequest::Activated { active } => state.on_activated(active).await,

                HubRequest::CallTimeout { route_id } => state.on_timeout(route_id).await,

                HubRequest::SetMaxConcurrency { max } => {
                    info!(max, "Setting max concurrency");
                    if max + 2 > self.config.context_buffer() {
                        warn!(
                            max,
                            context_buffer = self.config.context_buffer(),
                            "Context buffers smaller than a batch of forwarded calls"
                        );
                    }
                    state.queue.set_max_concurrency(max).await;
                }

                HubRequest::GetMetrics { reply } => {
                    let _ = reply.send(state.snapshot().await);
                }

                HubRequest::Shutdown => {
                    info!("Hub shutting down");
                    break;
                }
            }

            state.reap().await;
        }

        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        state.queue.destroy().await;
        info!("Hub stopped");
    }
}

/// Forward activation events from the queue into the hub loop
fn spawn_activation_bridge(
    queue: EventQueue<RouteId>,
    mut rx: broadcast::Receiver<Activation<RouteId>>,
    hub_tx: mpsc::Sender<HubRequest>,
) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(activation) => {
                    if hub_tx
                        .send(HubRequest::Activated {
                            active: activation.active,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Activation listener lagged, requesting fresh snapshot");
                    queue.re_activation().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Activation bridge stopped");
    });
}

/// State owned by the hub loop
struct HubState {
    config: HubConfig,
    hub_tx: mpsc::Sender<HubRequest>,
    registry: Registry,
    router: Router,
    queue: EventQueue<RouteId>,

    /// Timeout timer of every open call
    timers: HashMap<RouteId, JoinHandle<()>>,

    /// Contexts whose channel failed on send, disconnected after the current request
    dead: Vec<ContextId>,

    metrics: HubMetrics,
}

impl HubState {
    async fn on_connect(&mut self, tx: mpsc::Sender<HubMessage>, reply: oneshot::Sender<ContextId>) {
        let context_id = self.registry.connect(tx);
        info!(context_id, connected = self.registry.len(), "Context connected");

        if reply.send(context_id).is_err() {
            // Caller gave up before learning its id; its channel is useless
            self.dead.push(context_id);
            return;
        }

        self.send_to(context_id, HubMessage::Welcome { context_id });
        self.elect_owner().await;
    }

    async fn on_disconnect(&mut self, context_id: ContextId) {
        let Some(departure) = self.registry.disconnect(context_id) else {
            debug!(context_id, "Disconnect for unknown context ignored");
            return;
        };
        info!(context_id, was_owner = departure.was_owner, "Context disconnected");

        // Nobody is left to answer these
        for (route_id, call) in self.router.drop_origin(context_id) {
            debug!(route_id, "Dropping call of departed context");
            self.disarm(route_id);
            if call.holds_slot() {
                self.queue.complete_task(&route_id).await;
            }
        }

        if departure.was_owner {
            for (route_id, call) in self.router.orphaned_by(context_id) {
                warn!(route_id, origin = call.origin, "Owner lost while handling call");
                self.disarm(route_id);
                self.queue.complete_task(&route_id).await;
                self.fail(
                    call.origin,
                    call.correlation_id,
                    CallFailure::new(FailureKind::OwnerLost, "owner disconnected before responding"),
                );
            }
        }
    }

    /// Fill an empty owner slot and hand the new owner its held calls
    async fn elect_owner(&mut self) {
        while let Some(owner) = self.registry.elect() {
            if self.send_to(owner, HubMessage::ElectionNotice) {
                self.forward_admitted();
                return;
            }

            warn!(context_id = owner, "Elected context unreachable, electing again");
            self.dead.retain(|id| *id != owner);
            self.on_disconnect(owner).await;
        }

        if self.registry.owner().is_none() {
            debug!("No connected contexts, owner slot stays empty");
        }
    }

    async fn on_inbound(&mut self, from: ContextId, message: ContextMessage) {
        if !self.registry.contains(from) {
            warn!(context_id = from, "Message from unknown context dropped");
            return;
        }

        match message {
            ContextMessage::Request { id, kind, payload } => {
                let route_id = self.router.open(from, id, kind, payload);

                let timeout = self.config.call_timeout();
                let timeout_tx = self.hub_tx.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = timeout_tx.send(HubRequest::CallTimeout { route_id }).await;
                });
                self.timers.insert(route_id, timer);

                self.queue.enqueue(route_id).await;
            }

            ContextMessage::Response { id, data, error } => match self.router.resolve(&id, from) {
                Ok((route_id, call)) => {
                    debug!(route_id, origin = call.origin, "Routing response to caller");
                    self.disarm(route_id);
                    self.queue.complete_task(&route_id).await;
                    self.send_to(
                        call.origin,
                        HubMessage::Response {
                            id: call.correlation_id,
                            data,
                            error,
                        },
                    );
                }
                Err(miss) => {
                    self.metrics.routing_misses += 1;
                    match miss {
                        RoutingMiss::Unknown => {
                            warn!(%id, context_id = from, "Response for unknown or expired call dropped")
                        }
                        RoutingMiss::WrongResponder { expected } => {
                            warn!(%id, context_id = from, ?expected, "Response from a context the call was not routed to dropped")
                        }
                    }
                }
            },

            ContextMessage::Broadcast { event_type, payload } => {
                let result = fan_out(&self.registry, from, &event_type, &payload, self.config.exclude_sender);
                debug!(from, %event_type, delivered = result.delivered, dropped = result.dropped, "Broadcast fanned out");
                self.metrics.broadcasts += 1;
                self.metrics.messages_sent += result.delivered as u64;
            }
        }
    }

    async fn on_activated(&mut self, active: Vec<RouteId>) {
        for route_id in self.router.admit(&active) {
            debug!(route_id, "Releasing slot of call that ended while queued");
            self.queue.complete_task(&route_id).await;
        }
        self.forward_admitted();
    }

    async fn on_timeout(&mut self, route_id: RouteId) {
        self.timers.remove(&route_id);
        let Some(call) = self.router.expire(route_id) else {
            return;
        };

        warn!(route_id, origin = call.origin, kind = %call.kind, "Call timed out");
        self.metrics.call_timeouts += 1;
        if call.holds_slot() {
            self.queue.complete_task(&route_id).await;
        }

        let message = format!("no response within {}ms", self.config.call_timeout_ms);
        self.fail(call.origin, call.correlation_id, CallFailure::new(FailureKind::Timeout, message));
    }

    /// Send every admitted call to the current owner
    fn forward_admitted(&mut self) {
        let Some(owner) = self.registry.owner() else {
            return;
        };

        for forward in self.router.take_forwardable(owner) {
            debug!(route_id = forward.route_id, owner, "Forwarding call to owner");
            self.send_to(
                owner,
                HubMessage::Request {
                    id: forward.route_id.to_string(),
                    kind: forward.kind,
                    payload: forward.payload,
                },
            );
        }
    }

    /// Cancel the timeout timer of a call that ended
    fn disarm(&mut self, route_id: RouteId) {
        if let Some(timer) = self.timers.remove(&route_id) {
            timer.abort();
        }
    }

    fn fail(&mut self, origin: ContextId, correlation_id: String, failure: CallFailure) {
        self.send_to(
            origin,
            HubMessage::Response {
                id: correlation_id,
                data: None,
                error: Some(failure),
            },
        );
    }

    /// Send to one context without waiting
    ///
    /// A closed or full channel marks the context dead. The hub loop never
    /// waits on a context, so one that stops reading cannot stall the others.
    fn send_to(&mut self, context_id: ContextId, msg: HubMessage) -> bool {
        let Some(entry) = self.registry.get(context_id) else {
            debug!(context_id, "send_to: context not connected");
            return false;
        };

        match entry.tx.try_send(msg) {
            Ok(()) => {
                self.metrics.messages_sent += 1;
                true
            }
            Err(e) => {
                match e {
                    TrySendError::Full(_) => {
                        warn!(context_id, "Context not reading, channel full; disconnecting");
                        self.metrics.slow_disconnects += 1;
                    }
                    TrySendError::Closed(_) => warn!(context_id, "Context channel closed"),
                }
                if !self.dead.contains(&context_id) {
                    self.dead.push(context_id);
                }
                false
            }
        }
    }

    /// Disconnect contexts found dead while handling the last request
    async fn reap(&mut self) {
        while let Some(context_id) = self.dead.pop() {
            self.on_disconnect(context_id).await;
            self.elect_owner().await;
        }
    }

    async fn snapshot(&self) -> HubMetrics {
        HubMetrics {
            connected_contexts: self.registry.len(),
            owner: self.registry.owner(),
            owner_since: self.registry.owner_since(),
            pending_calls: self.router.len(),
            armed_timers: self.timers.len(),
            active_tasks: self.queue.active().await.len(),
            queued_tasks: self.queue.pending_len().await,
            ..self.metrics.clone()
        }
    }
}
