//! Hub configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::queue::QueueConfig;

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Max routed calls in flight against the owner
    #[serde(default = "default_max_concurrency", rename = "max-concurrency")]
    pub max_concurrency: usize,

    /// Routed call timeout in milliseconds
    #[serde(default = "default_call_timeout_ms", rename = "call-timeout-ms")]
    pub call_timeout_ms: u64,

    /// Skip the sender when fanning out a broadcast
    #[serde(default = "default_exclude_sender", rename = "exclude-sender")]
    pub exclude_sender: bool,

    /// Channel buffer size for hub requests
    #[serde(default = "default_channel_buffer", rename = "channel-buffer")]
    pub channel_buffer: usize,

    /// Channel buffer size for each context's messages
    ///
    /// A context whose buffer is full when the hub sends to it is
    /// disconnected. See [`HubConfig::context_buffer`].
    #[serde(default = "default_context_channel_buffer", rename = "context-channel-buffer")]
    pub context_channel_buffer: usize,
}

fn default_max_concurrency() -> usize {
    debug!("default_max_concurrency: called");
    5
}

fn default_call_timeout_ms() -> u64 {
    debug!("default_call_timeout_ms: called");
    30_000
}

fn default_exclude_sender() -> bool {
    true
}

fn default_channel_buffer() -> usize {
    debug!("default_channel_buffer: called");
    1000
}

fn default_context_channel_buffer() -> usize {
    debug!("default_context_channel_buffer: called");
    100
}

impl Default for HubConfig {
    fn default() -> Self {
        debug!("HubConfig::default: called");
        Self {
            max_concurrency: 5,
            call_timeout_ms: 30_000,
            exclude_sender: true,
            channel_buffer: 1000,
            context_channel_buffer: 100,
        }
    }
}

impl HubConfig {
    /// Get the call timeout as a Duration
    pub fn call_timeout(&self) -> Duration {
        debug!(call_timeout_ms = %self.call_timeout_ms, "HubConfig::call_timeout: called");
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Buffer size actually used for per-context channels
    ///
    /// Never smaller than `max_concurrency + 2`, so an owner can hold a full
    /// batch of forwarded calls next to its Welcome and ElectionNotice.
    pub fn context_buffer(&self) -> usize {
        self.context_channel_buffer.max(self.max_concurrency + 2)
    }

    /// Configuration for the hub's admission queue
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default().with_max_concurrency(self.max_concurrency)
    }
}
