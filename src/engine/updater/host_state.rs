//! Persisted Host State
//!
//! The skipped version and rollout group survive between checks. The
//! selector and coordinator only ever see a `HostState` snapshot built by
//! `load`; the mutating operations belong to the surrounding application
//! (user pressed "skip", first launch).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::feed::HostState;

pub const HOST_STATE_FILE: &str = "host-state.json";

#[derive(Error, Debug)]
pub enum HostStateError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid host state file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Rollout needs at least one group")]
    NoGroups,
}

/// On-disk part of the host state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHostState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_group: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct HostStateStore {
    path: PathBuf,
}

impl HostStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(HOST_STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored values, or defaults when nothing was saved yet.
    pub fn read(&self) -> Result<StoredHostState, HostStateError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StoredHostState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot for one update check.
    pub fn load(
        &self,
        current_version: &str,
        os_version: &str,
        allowed_channels: &[String],
    ) -> Result<HostState, HostStateError> {
        let stored = self.read()?;
        let mut host = HostState::new(current_version, os_version);
        host.skipped_version = stored.skipped_version;
        host.rollout_group = stored.rollout_group;
        host.allowed_channels = allowed_channels.to_vec();
        Ok(host)
    }

    pub fn record_skip(&self, version: &str) -> Result<(), HostStateError> {
        let mut stored = self.read()?;
        stored.skipped_version = Some(version.to_string());
        info!("Skipping version {}", version);
        self.save(stored)
    }

    pub fn clear_skip(&self) -> Result<(), HostStateError> {
        let mut stored = self.read()?;
        if stored.skipped_version.take().is_none() {
            return Ok(());
        }
        self.save(stored)
    }

    /// Pick a random group in `0..groups` once; later calls return the
    /// stored group unchanged.
    pub fn assign_rollout_group(&self, groups: u32) -> Result<u32, HostStateError> {
        if groups == 0 {
            return Err(HostStateError::NoGroups);
        }
        let mut stored = self.read()?;
        if let Some(group) = stored.rollout_group {
            return Ok(group);
        }
        let group = rand::thread_rng().gen_range(0..groups);
        debug!("Assigned rollout group {}", group);
        stored.rollout_group = Some(group);
        self.save(stored)?;
        Ok(group)
    }

    fn save(&self, mut stored: StoredHostState) -> Result<(), HostStateError> {
        stored.updated_at = Some(Utc::now());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write to temp file first, then rename
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, serde_json::to_string_pretty(&stored)?)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
