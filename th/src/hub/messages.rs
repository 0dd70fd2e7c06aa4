//! Message types for the Hub

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Identifier the hub assigns to a context when it connects
pub type ContextId = u64;

/// Identifier the hub assigns to a call it routes to the owner
pub type RouteId = u64;

/// Why a routed call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// No response before the call timeout
    Timeout,
    /// The owner disconnected while handling the call
    OwnerLost,
    /// The resource rejected or failed the operation
    Resource,
    /// The owner has no handler installed
    NoHandler,
    /// The request itself is not acceptable
    Rejected,
}

/// Error object carried by a failed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CallFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Resource, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, message)
    }
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Messages a context sends to the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContextMessage {
    /// Call to be routed to the owner
    Request {
        id: String,
        kind: String,
        #[serde(default)]
        payload: Value,
    },

    /// Owner's answer to a routed call; `id` is the route id it was sent
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<CallFailure>,
    },

    /// Fan-out to the other contexts
    Broadcast {
        #[serde(rename = "event-type")]
        event_type: String,
        #[serde(default)]
        payload: Value,
    },
}

/// Messages the hub sends to a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubMessage {
    /// First message on every channel
    Welcome {
        #[serde(rename = "context-id")]
        context_id: ContextId,
    },

    /// Sent once to the context that became owner
    ElectionNotice,

    /// Routed call for the owner to execute
    Request {
        id: String,
        kind: String,
        payload: Value,
    },

    /// Result of a call this context made; `id` is its own correlation id
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<CallFailure>,
    },

    /// Broadcast from another context
    Broadcast {
        #[serde(rename = "event-type")]
        event_type: String,
        payload: Value,
    },
}

/// Internal requests to the Hub task
#[derive(Debug)]
pub enum HubRequest {
    /// Register a new context channel
    Connect {
        tx: mpsc::Sender<HubMessage>,
        reply: oneshot::Sender<ContextId>,
    },

    /// A context's channel closed
    Disconnect { context_id: ContextId },

    /// A message read from a context's channel
    Inbound { from: ContextId, message: ContextMessage },

    /// The EventQueue published its active window (internal)
    Activated { active: Vec<RouteId> },

    /// A routed call ran out of time (internal)
    CallTimeout { route_id: RouteId },

    /// Adjust the admission limit for the next dispatch cycle
    SetMaxConcurrency { max: usize },

    /// Get current metrics
    GetMetrics { reply: oneshot::Sender<HubMetrics> },

    /// Shutdown the hub
    Shutdown,
}

/// Hub metrics for observability
#[derive(Debug, Clone, Default)]
pub struct HubMetrics {
    pub connected_contexts: usize,
    pub owner: Option<ContextId>,
    pub owner_since: Option<DateTime<Utc>>,
    pub pending_calls: usize,
    /// Call timeout timers not yet fired or disarmed
    pub armed_timers: usize,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub broadcasts: u64,
    pub call_timeouts: u64,
    pub routing_misses: u64,
    /// Contexts disconnected because their channel was full
    pub slow_disconnects: u64,
}
