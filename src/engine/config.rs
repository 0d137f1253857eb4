//! Updater Configuration Module
//! Handles loading and validating updater.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::platform::Platform;
use crate::engine::updater::coordinator::InstallerSettings;
use crate::engine::updater::identity::SigningIdentity;
use crate::engine::updater::verify::{IdentityPolicy, KeyError, TrustRoot};

pub const CONFIG_FILE: &str = "updater.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid public key: {0}")]
    InvalidKey(#[from] KeyError),
}

/// Settings bundled with the running application. Keys here are the only
/// trust anchors; nothing in the feed can replace them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Base64 Ed25519 public key
    #[serde(default)]
    pub public_ed_key: Option<String>,
    /// Base64 uncompressed P-256 point for legacy signatures
    #[serde(default)]
    pub public_legacy_key: Option<String>,
    #[serde(default)]
    pub allowed_successor_identities: Vec<String>,
    #[serde(default = "default_authorization_timeout")]
    pub authorization_timeout_secs: u64,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub clear_quarantine: bool,
    #[serde(default = "default_true")]
    pub refresh_index: bool,
    #[serde(default)]
    pub allowed_channels: Vec<String>,
}

fn default_authorization_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            public_ed_key: None,
            public_legacy_key: None,
            allowed_successor_identities: Vec::new(),
            authorization_timeout_secs: default_authorization_timeout(),
            state_dir: None,
            clear_quarantine: true,
            refresh_index: true,
            allowed_channels: Vec::new(),
        }
    }
}

impl UpdaterConfig {
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: UpdaterConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Like `load`, but a missing file yields the defaults
    pub fn load_or_default(dir: &Path) -> Result<Self, ConfigError> {
        match Self::load(dir) {
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        let config_path = dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn trust_root(&self) -> Result<TrustRoot, ConfigError> {
        Ok(TrustRoot::from_base64(
            self.public_ed_key.as_deref(),
            self.public_legacy_key.as_deref(),
        )?)
    }

    pub fn identity_policy(&self) -> IdentityPolicy {
        IdentityPolicy {
            allowed_successors: self
                .allowed_successor_identities
                .iter()
                .map(SigningIdentity::new)
                .collect(),
        }
    }

    /// Directory for journals, locks and staging. Falls back to the
    /// platform data directory, then the system temp dir.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .or_else(|| Platform::current().data_dir())
            .unwrap_or_else(|| std::env::temp_dir().join("bundle-updater"))
    }

    pub fn installer_settings(&self) -> InstallerSettings {
        InstallerSettings {
            authorization_timeout: Duration::from_secs(self.authorization_timeout_secs),
            state_dir: self.state_dir(),
            clear_quarantine: self.clear_quarantine,
            refresh_index: self.refresh_index,
        }
    }
}
