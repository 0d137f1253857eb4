//! Binary Delta Patches
//!
//! - `format` - container layout and manifest
//! - `apply` - applying a patch to a staged copy of the installed bundle
//! - `tree` - tree digests and copies
//! - `builder` - creating patches (tests and `test-utils`)

pub mod apply;
pub mod format;
pub mod tree;

#[cfg(any(test, feature = "test-utils"))]
pub mod builder;

pub use apply::PatchApplier;
pub use format::{DeltaManifest, DeltaOperation, EntryKind, PatchArchive, PATCH_FORMAT_VERSION};
pub use tree::{copy_tree, file_digest, tree_digest};

#[cfg(any(test, feature = "test-utils"))]
pub use builder::DeltaBuilder;
