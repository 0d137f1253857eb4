//! Bundle Self-Update System
//!
//! Picks the next release from a feed, proves it authentic and replaces the
//! installed bundle without ever leaving it half written.
//!
//! Components:
//! - `version` - Version ordering
//! - `feed` - Candidate records and host snapshot
//! - `selector` / `rollout` - Candidate selection and phased rollout
//! - `verify` / `identity` - Signatures and signing-identity continuity
//! - `patch` - Binary delta containers
//! - `stage` - Extraction of full archives
//! - `swap` - Atomic bundle replacement and crash recovery
//! - `state` / `coordinator` - Installation state machine
//! - `channel` / `fetch` - Privileged helper and artifact retrieval seams
//! - `host_state` - Persisted skip and rollout state

pub mod cancel;
pub mod channel;
pub mod coordinator;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod host_state;
pub mod identity;
pub mod patch;
pub mod rollout;
pub mod selector;
pub mod stage;
pub mod state;
pub mod swap;
pub mod verify;
pub mod version;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cancel::{CancelState, CancellationHandle};
pub use channel::{InProcessChannel, PrivilegedChannel, PrivilegedRequest};
pub use coordinator::{InstallPlan, InstallReport, InstallationCoordinator, InstallerSettings};
pub use error::{FailureReason, FeedInvalid, InstallError, PatchError};
pub use feed::{ArtifactDescriptor, CandidateRecord, DeltaDescriptor, HostState, SignatureSet};
pub use fetch::{ArtifactFetcher, LocalFetcher};
pub use host_state::HostStateStore;
pub use identity::{BundleInfo, IdentityInspector, ManifestInspector, SigningIdentity};
pub use patch::PatchApplier;
pub use rollout::{Clock, RolloutPolicy, StagedIntervalPolicy, SystemClock};
pub use selector::{CandidateSelector, SelectionDecision, SelectionReport};
pub use state::{InstallStateMachine, InstallationState};
pub use swap::BundleSwapper;
pub use verify::{IdentityPolicy, TrustRoot, TrustVerdict, TrustVerifier};
pub use version::{compare_versions, StandardVersionComparator, VersionComparator};
