//! Bounded-concurrency task admission
//!
//! The EventQueue never runs tasks. It moves them from a pending list into an
//! active window no larger than the configured concurrency and announces the
//! whole window to its listeners, who start and later complete the work.

mod config;
mod core;

pub use config::QueueConfig;
pub use core::{Activation, EventQueue};
