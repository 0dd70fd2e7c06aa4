//! TabHub configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::HubConfig;
use crate::ipc::get_socket_path;

/// Main TabHub configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hub behaviour
    pub hub: HubConfig,

    /// Socket configuration
    pub ipc: IpcConfig,

    /// Client node configuration
    pub node: NodeConfig,

    /// Store served by the owner
    pub store: StoreConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .tabhub.yml
        let local_config = PathBuf::from(".tabhub.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/tabhub/tabhub.yml
        if let Some(user_config) = user_config_path()
            && user_config.exists()
        {
            match Self::load_from_file(&user_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Follows the same fallback chain as `load` and never fails.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates: Vec<PathBuf> = match config_path {
            Some(path) => vec![path.clone()],
            None => [Some(PathBuf::from(".tabhub.yml")), user_config_path()]
                .into_iter()
                .flatten()
                .collect(),
        };

        candidates
            .iter()
            .filter(|path| path.exists())
            .find_map(|path| {
                let content = fs::read_to_string(path).ok()?;
                let config: Self = serde_yaml::from_str(&content).ok()?;
                Some(config.log_level)
            })
            .flatten()
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Socket path from config, or the default runtime location
    pub fn socket_path(&self) -> PathBuf {
        self.ipc.socket_path.clone().unwrap_or_else(get_socket_path)
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tabhub").join("tabhub.yml"))
}

/// Socket configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Unix socket path; defaults to `<runtime dir>/tabhub/hub.sock`
    #[serde(rename = "socket-path")]
    pub socket_path: Option<PathBuf>,
}

/// Client node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Client-side request timeout in milliseconds
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 35_000,
        }
    }
}

impl NodeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file; in-memory when unset
    #[serde(rename = "db-path")]
    pub db_path: Option<PathBuf>,
}
