//! Client side of the hub
//!
//! A [`ClientNode`] is one connected context. It issues requests, receives
//! broadcasts, and serves routed requests through its [`OwnerHandler`] when
//! the hub elects it owner.

mod client;
mod error;
mod handler;

pub use client::{BroadcastEvent, ClientNode, ClientNodeBuilder, DEFAULT_CALL_TIMEOUT, Role};
pub use error::CallError;
pub use handler::{OwnerHandler, Unserved};

#[cfg(test)]
pub use handler::mock;
