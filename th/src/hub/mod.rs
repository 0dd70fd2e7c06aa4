//! Hub for contexts sharing one backend resource
//!
//! The Hub mediates everything between connected contexts:
//! - **Election:** exactly one connected context owns the resource
//! - **Routing:** requests go to the owner, responses back to the caller
//! - **Broadcast:** best-effort fan-out to every other context
//!
//! Routed calls pass through an [`EventQueue`](crate::queue::EventQueue)
//! that bounds how many are in flight against the owner.

mod broadcast;
mod config;
mod core;
mod handle;
mod messages;
mod registry;
mod router;

pub use broadcast::{FanOut, fan_out};
pub use config::HubConfig;
pub use core::Hub;
pub use handle::HubHandle;
pub use messages::{
    CallFailure, ContextId, ContextMessage, FailureKind, HubMessage, HubMetrics, HubRequest, RouteId,
};
pub use registry::{ContextEntry, Departure, Registry};
pub use router::{CallState, Forward, PendingCall, Router, RoutingMiss};
