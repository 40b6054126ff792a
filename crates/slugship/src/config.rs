//! YAML configuration for the slugship CLI.
//!
//! The config file carries everything that is environment rather than
//! invocation: where the artifact store lives, transport defaults, install
//! defaults, and the fleet inventory for installations without a live
//! cloud provider.

use std::fs;
use std::path::{Path, PathBuf};

use fleet_deploy::ServerRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default project name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    /// Artifact store settings
    #[serde(default)]
    pub store: StoreSettings,

    /// Transport defaults
    #[serde(default)]
    pub ssh: SshSettings,

    /// Deployment defaults
    #[serde(default)]
    pub deploy: DeploySettings,

    /// Known fleet servers, resolvable by id, tag, or group
    #[serde(default)]
    pub fleet: Vec<ServerRecord>,
}

/// Artifact store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Directory the store lives in
    pub root: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("slugship")
            .join("store");
        Self { root }
    }
}

/// Transport defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SshSettings {
    /// Remote user; defaults to the local user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Identity (private key) file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<PathBuf>,

    /// SSH port; defaults to 22
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Deployment defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploySettings {
    /// Directory slugs install into on each host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Default hosts per batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Default pause between batches, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_pause: Option<u64>,
}

impl Config {
    /// Load configuration from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let body = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&body)?)
    }
}
