//! Configuration file for the skein CLI.
//!
//! Everything here is optional; command-line flags win over file values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Config load failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File unreadable
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// File readable but not valid TOML
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// CLI configuration file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and behaviour
    #[serde(default)]
    pub node: NodeSection,

    /// Listen address and seed peers
    #[serde(default)]
    pub network: NetworkSection,

    /// Logging defaults
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[node]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSection {
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Stable peer id; generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,

    /// Discovery service name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Hop budget for originated messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<u32>,

    /// Connect to discovered peers automatically
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Advertise on startup
    #[serde(default = "default_true")]
    pub auto_advertise: bool,
}

/// `[network]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// TCP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Seed addresses probed during discovery
    #[serde(default)]
    pub seeds: Vec<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            seeds: Vec::new(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level filter (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }
}
