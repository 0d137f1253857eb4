//! Updater Error Types

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::IllegalTransition;
use crate::engine::locks::LockError;

/// A feed record that cannot be evaluated. The record is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedInvalid {
    #[error("Candidate has no version")]
    MissingVersion,

    #[error("Candidate {version} has no artifact URL")]
    MissingArtifactUrl { version: String },

    #[error("Candidate {version} declares a zero-length artifact")]
    ZeroLength { version: String },

    #[error("Candidate {version} declares rollout percentage {percent} (max 100)")]
    RolloutOutOfRange { version: String, percent: u8 },

    #[error("Candidate {version} has a delta without base version or URL")]
    MalformedDelta { version: String },
}

/// Reasons a patch could not be applied. Every variant leaves the base
/// bundle untouched.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Patch is corrupt: {0}")]
    Corrupt(String),

    #[error("Patch is unsupported: {0}")]
    Unsupported(String),

    #[error("Patch application cancelled")]
    Cancelled,

    #[error("IO error while applying patch: {0}")]
    Io(#[from] io::Error),
}

/// Typed reason carried by a failed installation attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("Update is not trusted: {0}")]
    Untrusted(String),

    #[error("Update cannot be verified: {0}")]
    Unverifiable(String),

    #[error("Could not fetch update: {0}")]
    FetchFailed(String),

    #[error("Could not stage update: {0}")]
    StagingFailed(String),

    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Authorization timed out after {0}s")]
    AuthorizationTimeout(u64),

    #[error("Swap failed, previous bundle left in place: {0}")]
    SwapFailed(String),

    #[error("Installation cancelled")]
    Cancelled,
}

/// Errors while turning a full artifact into a staged bundle.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported archive format: {0}")]
    UnsupportedArchive(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Archive must contain exactly one top-level bundle, found {0}")]
    BundleLayout(usize),

    #[error("Staging cancelled")]
    Cancelled,
}

/// Errors of the atomic swap.
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("IO error during swap: {0}")]
    Io(#[from] io::Error),

    #[error("Staged bundle not found: {0}")]
    StagedMissing(PathBuf),

    #[error("Installed bundle path has no parent directory: {0}")]
    NoParent(PathBuf),

    #[error("Swap journal error: {0}")]
    Journal(String),

    #[error("Swap failed and rollback also failed ({rollback}); previous bundle kept at {backup}")]
    RollbackFailed { rollback: String, backup: PathBuf },
}

/// Failures reported by the privileged-operation channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Request denied: {0}")]
    Denied(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Channel transport error: {0}")]
    Transport(String),

    #[error("Privileged operation failed: {0}")]
    Failed(String),
}

/// Failures reported by an artifact fetcher.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Unsupported artifact URL: {0}")]
    UnsupportedUrl(String),

    #[error("Artifact length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
}

/// Errors raised before an installation attempt starts.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Another installation is already running for {0}")]
    Busy(PathBuf),

    #[error("Install lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Could not recover interrupted swap: {0}")]
    Recovery(#[from] SwapError),

    #[error("Selection decision carries no update to install")]
    NoUpdate,

    #[error(transparent)]
    State(#[from] IllegalTransition),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Cancellation requests that arrive too late.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    #[error("Swap already in progress; installation can no longer be cancelled")]
    SwapInProgress,
}

/// Errors reading a bundle's identity metadata.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid bundle info: {0}")]
    Parse(#[from] serde_json::Error),
}
