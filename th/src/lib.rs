//! TabHub - one owner for a shared resource, many contexts
//!
//! Contexts connect to a [`hub::Hub`]. The hub elects exactly one connected
//! context as owner, routes every context's requests to it through a
//! bounded-concurrency [`queue::EventQueue`], and fans broadcasts out to the
//! rest. Contexts in other processes connect over a Unix socket ([`ipc`]).

pub mod channel;
pub mod cli;
pub mod config;
pub mod hub;
pub mod ipc;
pub mod node;
pub mod queue;
pub mod store;

pub use channel::Channel;
pub use config::Config;
pub use hub::{Hub, HubConfig, HubHandle};
pub use node::{CallError, ClientNode, OwnerHandler};
pub use queue::{Activation, EventQueue, QueueConfig};
pub use store::StoreHandler;
