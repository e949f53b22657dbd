//! Configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::endpoint::DEFAULT_USER;

/// Main configuration. Every field can be overridden from the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Region for instance lookups and key pushes (default: "eu-west-1")
    pub region: String,

    /// Default OS user on instances
    pub user: String,

    /// Tag used to find a bastion when no instance id is given, as key:value
    pub tag: String,

    /// Private key for literal host[:port] hops
    pub identity_file: Option<PathBuf>,

    /// Seconds between background key re-pushes (0 disables)
    pub key_refresh_secs: u64,

    /// GitHub repository queried by `update`
    pub update_repository: String,

    /// SSH client settings
    #[serde(default)]
    pub ssh: SshSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: "eu-west-1".to_string(),
            user: DEFAULT_USER.to_string(),
            tag: "role:bastion".to_string(),
            identity_file: None,
            key_refresh_secs: 60,
            update_repository: "nodefortytwo/amz-ssh".to_string(),
            ssh: SshSettings::default(),
        }
    }
}

/// SSH client behaviour shared by every hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Keepalive interval in seconds (0 disables)
    pub keepalive_secs: u64,

    /// Per-hop dial and handshake timeout. Unset waits indefinitely.
    pub connect_timeout_secs: Option<u64>,

    /// Seconds one tunnel direction may keep running after the other has
    /// closed. Unset lets it finish on its own.
    pub drain_timeout_secs: Option<u64>,

    /// TERM sent with the pty request when $TERM is unset
    pub term: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            keepalive_secs: 30,
            connect_timeout_secs: None,
            drain_timeout_secs: None,
            term: "xterm-256color".to_string(),
        }
    }
}

impl Config {
    /// Default location: `<config dir>/amz-ssh/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("amz-ssh")
            .join("config.toml")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}
