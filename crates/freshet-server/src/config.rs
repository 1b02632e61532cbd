//! Server configuration file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use freshet_core::RuntimeConfig;

/// Top-level server configuration, loaded from a TOML file.
///
/// ```toml
/// listen_addr = "127.0.0.1:7070"
/// peers = ["127.0.0.1:7071"]
///
/// [runtime]
/// application_id = "commit-totals"
/// state_directory = "./freshet-state"
/// commit_interval_ms = 100
/// window_size_ms = 60000
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the query endpoint binds, and this instance's identity in
    /// the ownership directory.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Query addresses of peer instances sharing the workload. The
    /// ownership directory is built from `listen_addr` plus `peers`,
    /// sorted, so all instances agree on the order.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Runtime configuration.
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7070".to_string()
}

fn default_runtime() -> RuntimeConfig {
    RuntimeConfig::new("freshet-demo")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            peers: Vec::new(),
            runtime: default_runtime(),
        }
    }
}

impl ServerConfig {
    /// Loads a config file, or returns defaults if `path` does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}
