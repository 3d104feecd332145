//! Node configuration file.
//!
//! Every table is optional; a missing file yields the defaults.

use std::path::Path;

use anyhow::{Context, Result};
use halfway_mesh::{MeshConfig, SignalConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Relay used by `join`
    pub relay_url: String,
    pub mesh: MeshConfig,
    pub signal: SignalConfig,
    pub logging: LoggingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            mesh: MeshConfig::default(),
            signal: SignalConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load from `path`, falling back to defaults when no file is given
    /// or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(raw)?;
        config.mesh.validate()?;
        Ok(config)
    }
}
