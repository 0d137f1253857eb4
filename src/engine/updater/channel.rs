//! Privileged Operation Channel
//!
//! Requests the coordinator cannot perform itself when the install location
//! belongs to another user. A separate helper process would sit on the far
//! side of this channel; `InProcessChannel` serves the already-privileged
//! case directly.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{ChannelError, SwapError};
use super::swap::BundleSwapper;
use crate::engine::platform;

/// Request sent to the privileged side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum PrivilegedRequest {
    AcquireElevatedAccess { destination: PathBuf },
    PerformSwap { staged: PathBuf, installed: PathBuf },
    ClearQuarantine { bundle: PathBuf },
    RefreshIndex { bundle: PathBuf },
}

impl PrivilegedRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AcquireElevatedAccess { .. } => "acquire_elevated_access",
            Self::PerformSwap { .. } => "perform_swap",
            Self::ClearQuarantine { .. } => "clear_quarantine",
            Self::RefreshIndex { .. } => "refresh_index",
        }
    }
}

/// Request/response channel to the privileged helper.
#[async_trait]
pub trait PrivilegedChannel: Send + Sync {
    async fn send(&self, request: PrivilegedRequest) -> Result<(), ChannelError>;
}

/// Executes requests in the current process with its own permissions.
#[derive(Debug, Clone)]
pub struct InProcessChannel {
    journal_dir: PathBuf,
}

impl InProcessChannel {
    pub fn new(journal_dir: impl Into<PathBuf>) -> Self {
        Self {
            journal_dir: journal_dir.into(),
        }
    }

    fn check_access(destination: &Path) -> Result<(), ChannelError> {
        if platform::is_writable(destination) {
            Ok(())
        } else {
            Err(ChannelError::Denied(format!(
                "no write access to {}",
                destination.display()
            )))
        }
    }
}

#[async_trait]
impl PrivilegedChannel for InProcessChannel {
    async fn send(&self, request: PrivilegedRequest) -> Result<(), ChannelError> {
        debug!("Handling privileged request {}", request.name());
        match request {
            PrivilegedRequest::AcquireElevatedAccess { destination } => {
                Self::check_access(&destination)
            }
            PrivilegedRequest::PerformSwap { staged, installed } => {
                let swapper = BundleSwapper::new(self.journal_dir.clone());
                tokio::task::spawn_blocking(move || {
                    let outcome = swapper.swap(&staged, &installed)?;
                    if let Err(e) = swapper.discard_previous(&outcome) {
                        warn!("Failed to remove replaced bundle: {}", e);
                    }
                    Ok::<(), SwapError>(())
                })
                .await
                .map_err(|e| ChannelError::Transport(e.to_string()))?
                .map_err(|e| ChannelError::Failed(e.to_string()))
            }
            PrivilegedRequest::ClearQuarantine { bundle } => {
                platform::macos::clear_quarantine(&bundle)
                    .await
                    .map_err(|e| ChannelError::Failed(e.to_string()))
            }
            PrivilegedRequest::RefreshIndex { bundle } => platform::macos::refresh_index(&bundle)
                .await
                .map_err(|e| ChannelError::Failed(e.to_string())),
        }
    }
}
