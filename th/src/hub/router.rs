//! Routed call bookkeeping
//!
//! Every request a context makes becomes a [`PendingCall`] under a hub-wide
//! [`RouteId`]. The owner only ever sees route ids; the caller only ever sees
//! its own correlation id. The router owns the mapping between the two.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use super::messages::{ContextId, RouteId};

/// Where a call is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Waiting for an admission slot
    Queued,
    /// Holding a slot, waiting for an owner
    Admitted,
    /// Sent to this owner, waiting for its response
    Forwarded(ContextId),
}

/// A call in flight through the hub
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub origin: ContextId,
    pub correlation_id: String,
    pub kind: String,
    pub payload: Value,
    pub created_at: Instant,
    pub state: CallState,
}

impl PendingCall {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the call currently holds an admission slot
    pub fn holds_slot(&self) -> bool {
        !matches!(self.state, CallState::Queued)
    }
}

/// Why a response could not be matched to a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingMiss {
    /// Id is malformed, expired, or already answered
    Unknown,
    /// The call was never forwarded to the responder
    WrongResponder { expected: Option<ContextId> },
}

/// A call ready to be sent to the owner
#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    pub route_id: RouteId,
    pub kind: String,
    pub payload: Value,
}

/// Hub-side table of pending calls
#[derive(Debug, Default)]
pub struct Router {
    next_id: RouteId,
    calls: BTreeMap<RouteId, PendingCall>,

    /// Calls removed while still queued; their slot is released once the
    /// queue reports them active
    stale: HashSet<RouteId>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new call and return its route id
    pub fn open(&mut self, origin: ContextId, correlation_id: String, kind: String, payload: Value) -> RouteId {
        self.next_id += 1;
        let route_id = self.next_id;
        debug!(route_id, origin, %correlation_id, %kind, "Router::open");
        self.calls.insert(
            route_id,
            PendingCall {
                origin,
                correlation_id,
                kind,
                payload,
                created_at: Instant::now(),
                state: CallState::Queued,
            },
        );
        route_id
    }

    /// Apply an activation snapshot
    ///
    /// Marks queued calls in `active` as admitted and returns the route ids
    /// whose slot must be released because their call is already gone.
    pub fn admit(&mut self, active: &[RouteId]) -> Vec<RouteId> {
        let mut release = Vec::new();
        for route_id in active {
            match self.calls.get_mut(route_id) {
                Some(call) if call.state == CallState::Queued => call.state = CallState::Admitted,
                Some(_) => {}
                None => {
                    if self.stale.remove(route_id) {
                        release.push(*route_id);
                    }
                }
            }
        }
        release
    }

    /// Mark every admitted call as forwarded to `owner`, oldest first
    pub fn take_forwardable(&mut self, owner: ContextId) -> Vec<Forward> {
        self.calls
            .iter_mut()
            .filter(|(_, call)| call.state == CallState::Admitted)
            .map(|(route_id, call)| {
                call.state = CallState::Forwarded(owner);
                Forward {
                    route_id: *route_id,
                    kind: call.kind.clone(),
                    payload: call.payload.clone(),
                }
            })
            .collect()
    }

    /// Match a response from `responder` to its call and remove it
    pub fn resolve(&mut self, route_id: &str, responder: ContextId) -> Result<(RouteId, PendingCall), RoutingMiss> {
        let route_id: RouteId = route_id.parse().map_err(|_| RoutingMiss::Unknown)?;
        let call = self.calls.get(&route_id).ok_or(RoutingMiss::Unknown)?;

        match call.state {
            CallState::Forwarded(owner) if owner == responder => {}
            CallState::Forwarded(owner) => return Err(RoutingMiss::WrongResponder { expected: Some(owner) }),
            _ => return Err(RoutingMiss::WrongResponder { expected: None }),
        }

        let call = self.calls.remove(&route_id).ok_or(RoutingMiss::Unknown)?;
        Ok((route_id, call))
    }

    /// Remove a call whose timeout fired
    pub fn expire(&mut self, route_id: RouteId) -> Option<PendingCall> {
        let call = self.remove(route_id)?;
        debug!(route_id, age_ms = call.age().as_millis() as u64, "Router::expire");
        Some(call)
    }

    /// Remove every call forwarded to an owner that went away
    pub fn orphaned_by(&mut self, owner: ContextId) -> Vec<(RouteId, PendingCall)> {
        let ids: Vec<RouteId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.state == CallState::Forwarded(owner))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|call| (id, call)))
            .collect()
    }

    /// Remove every call made by a context that went away
    pub fn drop_origin(&mut self, origin: ContextId) -> Vec<(RouteId, PendingCall)> {
        let ids: Vec<RouteId> = self
            .calls
            .iter()
            .filter(|(_, call)| call.origin == origin)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|call| (id, call)))
            .collect()
    }

    pub fn get(&self, route_id: RouteId) -> Option<&PendingCall> {
        self.calls.get(&route_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn remove(&mut self, route_id: RouteId) -> Option<PendingCall> {
        let call = self.calls.remove(&route_id)?;
        if call.state == CallState::Queued {
            self.stale.insert(route_id);
        }
        Some(call)
    }
}
