//! Bundle Updater - self-update engine for installed application bundles
//!
//! Selects the next release from a feed, verifies it against pinned keys and
//! swaps it into place atomically. See `engine::updater` for the pieces.

pub mod engine;

pub use engine::config::{ConfigError, UpdaterConfig};
pub use engine::updater::{
    CancellationHandle, CandidateRecord, CandidateSelector, HostState, InstallPlan, InstallReport,
    InstallationCoordinator, SelectionDecision, TrustVerdict, TrustVerifier,
};
