//! Install Lock System
//!
//! Keeps two installations from touching the same bundle at once, whether
//! they run in this process or another one.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// Bundles locked by this process.
fn active_bundles() -> &'static Mutex<HashSet<PathBuf>> {
    static ACTIVE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Canonical form of a bundle path, so `apps/App` and `apps/../apps/App`
/// name the same bundle. The bundle itself may not exist yet: only its
/// parent is resolved, falling back to a lexical clean-up when the parent
/// is missing too.
pub fn normalize_bundle_path(bundle: &Path) -> PathBuf {
    let absolute = if bundle.is_absolute() {
        bundle.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(bundle),
            Err(_) => bundle.to_path_buf(),
        }
    };
    let lexical = lexical_normalize(&absolute);

    match (lexical.parent(), lexical.file_name()) {
        (Some(parent), Some(name)) => match fs::canonicalize(parent) {
            Ok(parent) => parent.join(name),
            Err(_) => lexical,
        },
        _ => lexical,
    }
}

/// Short hash identifying a bundle in lock and journal file names.
pub fn bundle_key(bundle: &Path) -> String {
    let normalized = normalize_bundle_path(bundle);
    let digest = Sha256::digest(normalized.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    clean.push(component);
                }
            }
            other => clean.push(other),
        }
    }
    clean
}

/// Information stored in a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub bundle: PathBuf,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub description: String,
}

impl LockInfo {
    pub fn new(bundle: &Path) -> Self {
        Self {
            bundle: bundle.to_path_buf(),
            pid: std::process::id(),
            started_at: Utc::now(),
            description: format!("Installing update into {}", bundle.display()),
        }
    }

    /// Check if the process that created the lock is still running
    pub fn is_process_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }

        #[cfg(unix)]
        {
            use std::process::Command;
            Command::new("kill")
                .args(["-0", &self.pid.to_string()])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        #[cfg(windows)]
        {
            use std::process::Command;
            Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", self.pid)])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&self.pid.to_string()))
                .unwrap_or(false)
        }

        #[cfg(not(any(unix, windows)))]
        true
    }
}

/// Lock errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("{bundle:?} is locked by PID {pid}: {description}")]
    AlreadyLocked {
        bundle: PathBuf,
        pid: u32,
        description: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Per-bundle install lock manager
#[derive(Debug, Clone)]
pub struct InstallLocks {
    locks_dir: PathBuf,
}

impl InstallLocks {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            locks_dir: state_dir.join("locks"),
        }
    }

    /// Lock file for a bundle, named after a hash of its normalized path
    pub fn lock_path(&self, bundle: &Path) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", bundle_key(bundle)))
    }

    /// Acquire the install lock for `bundle`
    pub fn acquire(&self, bundle: &Path) -> Result<LockGuard, LockError> {
        let normalized = normalize_bundle_path(bundle);
        {
            let mut active = active_bundles()
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !active.insert(normalized.clone()) {
                return Err(LockError::AlreadyLocked {
                    bundle: bundle.to_path_buf(),
                    pid: std::process::id(),
                    description: "Installation running in this process".to_string(),
                });
            }
        }

        match self.create_lock_file(bundle) {
            Ok(lock_path) => Ok(LockGuard {
                lock_path,
                bundle: bundle.to_path_buf(),
                registered: normalized,
            }),
            Err(e) => {
                release_in_process(&normalized);
                Err(e)
            }
        }
    }

    fn create_lock_file(&self, bundle: &Path) -> Result<PathBuf, LockError> {
        fs::create_dir_all(&self.locks_dir)?;
        let lock_path = self.lock_path(bundle);

        if let Some(existing) = self.read_lock(&lock_path) {
            if existing.is_process_alive() {
                return Err(LockError::AlreadyLocked {
                    bundle: bundle.to_path_buf(),
                    pid: existing.pid,
                    description: existing.description,
                });
            }
            warn!("Reclaiming stale install lock left by PID {}", existing.pid);
            let _ = fs::remove_file(&lock_path);
        }

        let content = serde_json::to_string_pretty(&LockInfo::new(bundle))?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Lost the race against another process
                let holder = self.read_lock(&lock_path);
                return Err(LockError::AlreadyLocked {
                    bundle: bundle.to_path_buf(),
                    pid: holder.as_ref().map(|h| h.pid).unwrap_or(0),
                    description: holder
                        .map(|h| h.description)
                        .unwrap_or_else(|| "Installation in progress".to_string()),
                });
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(content.as_bytes())?;
        debug!("Acquired install lock {:?}", lock_path);
        Ok(lock_path)
    }

    /// Read a lock file
    fn read_lock(&self, path: &Path) -> Option<LockInfo> {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    }

    /// Current holder of the lock for `bundle`, if any
    pub fn holder(&self, bundle: &Path) -> Option<LockInfo> {
        self.read_lock(&self.lock_path(bundle))
            .filter(|info| info.is_process_alive())
    }
}

fn release_in_process(bundle: &Path) {
    active_bundles()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(bundle);
}

/// RAII guard that releases lock on drop
pub struct LockGuard {
    lock_path: PathBuf,
    bundle: PathBuf,
    registered: PathBuf,
}

impl LockGuard {
    pub fn bundle(&self) -> &Path {
        &self.bundle
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
        release_in_process(&self.registered);
    }
}
