//! EventQueue configuration

use serde::{Deserialize, Serialize};

/// EventQueue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Max tasks in the active window
    #[serde(default = "default_max_concurrency", rename = "max-concurrency")]
    pub max_concurrency: usize,

    /// Activation events buffered per listener before it lags
    #[serde(default = "default_channel_capacity", rename = "channel-capacity")]
    pub channel_capacity: usize,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.channel_capacity, 64);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: QueueConfig = serde_yaml::from_str("max-concurrency: 2").unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.channel_capacity, 64);
    }
}
