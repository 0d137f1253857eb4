//! Patch application onto a staged copy of the base bundle.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::format::{relative_path, DeltaOperation, EntryKind, PatchArchive};
use super::tree::{copy_tree, file_digest, set_mode, tree_digest};
use crate::engine::updater::cancel::CancellationHandle;
use crate::engine::updater::error::PatchError;
use crate::engine::updater::verify::TrustVerifier;

/// Applies delta containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchApplier;

impl PatchApplier {
    pub fn new() -> Self {
        Self
    }

    /// Apply `patch` to a copy of `base` placed under `staging_root`.
    ///
    /// `base` is only read. On success the staged bundle's path is returned;
    /// on any error the staged copy is removed.
    pub fn apply(
        &self,
        base: &Path,
        patch: &Path,
        staging_root: &Path,
        cancel: &CancellationHandle,
    ) -> Result<PathBuf, PatchError> {
        self.apply_with_progress(base, patch, staging_root, cancel, &mut |_, _| {})
    }

    /// Like [`apply`](Self::apply), calling `progress(done, total)` after
    /// each operation.
    pub fn apply_with_progress(
        &self,
        base: &Path,
        patch: &Path,
        staging_root: &Path,
        cancel: &CancellationHandle,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<PathBuf, PatchError> {
        let archive = PatchArchive::read(patch)?;
        let manifest = &archive.manifest;
        info!(
            "Applying patch {} -> {} ({} operations)",
            manifest.base_version,
            manifest.target_version,
            manifest.operations.len()
        );

        if let Some(expected) = &manifest.base_tree_digest {
            let actual = tree_digest(base)?;
            if &actual != expected {
                return Err(PatchError::Corrupt(format!(
                    "base bundle does not match patch base {}",
                    manifest.base_version
                )));
            }
        }

        check_cancel(cancel)?;

        let name = base
            .file_name()
            .ok_or_else(|| PatchError::Unsupported(format!("base has no name: {:?}", base)))?;
        fs::create_dir_all(staging_root)?;
        let staged = staging_root.join(name);
        if fs::symlink_metadata(&staged).is_ok() {
            fs::remove_dir_all(&staged)?;
        }

        match self.apply_into(&archive, base, &staged, cancel, progress) {
            Ok(()) => {
                info!("Patch applied to {:?}", staged);
                Ok(staged)
            }
            Err(e) => {
                warn!("Patch failed, discarding staged copy: {}", e);
                if let Err(cleanup) = fs::remove_dir_all(&staged) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove staged copy {:?}: {}", staged, cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    fn apply_into(
        &self,
        archive: &PatchArchive,
        base: &Path,
        staged: &Path,
        cancel: &CancellationHandle,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<(), PatchError> {
        copy_tree(base, staged)?;

        let total = archive.manifest.operations.len();
        for (index, op) in archive.manifest.operations.iter().enumerate() {
            check_cancel(cancel)?;
            debug!("Patch op on {}", op.path());
            apply_operation(archive, staged, op)?;
            progress(index + 1, total);
        }
        check_cancel(cancel)?;

        if let Some(expected) = &archive.manifest.target_tree_digest {
            let actual = tree_digest(staged)?;
            if &actual != expected {
                return Err(PatchError::Corrupt(
                    "patched bundle does not match target digest".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn check_cancel(cancel: &CancellationHandle) -> Result<(), PatchError> {
    if cancel.is_cancelled() {
        Err(PatchError::Cancelled)
    } else {
        Ok(())
    }
}

/// Resolve a manifest path inside `root`, refusing to traverse symlinks
/// that could point outside of it.
fn resolve(root: &Path, path: &str) -> Result<PathBuf, PatchError> {
    let relative = relative_path(path)?;
    let mut current = root.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        current.push(component);
        if components.peek().is_some() {
            if let Ok(meta) = fs::symlink_metadata(&current) {
                if meta.file_type().is_symlink() {
                    return Err(PatchError::Unsupported(format!(
                        "path traverses symlink: {}",
                        path
                    )));
                }
            }
        }
    }
    Ok(current)
}

fn expect_digest(actual: &str, expected: &str, what: &str, path: &str) -> Result<(), PatchError> {
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(PatchError::Corrupt(format!("{} digest mismatch for {}", what, path)))
    }
}

fn payload<'a>(archive: &'a PatchArchive, id: &str) -> Result<&'a [u8], PatchError> {
    archive
        .payload(id)
        .ok_or_else(|| PatchError::Unsupported(format!("missing payload {}", id)))
}

fn apply_operation(
    archive: &PatchArchive,
    root: &Path,
    op: &DeltaOperation,
) -> Result<(), PatchError> {
    let target = resolve(root, op.path())?;
    let existing = fs::symlink_metadata(&target).ok();
    // Permission changes and directory creation would follow the link
    let is_link = existing.as_ref().map_or(false, |m| m.file_type().is_symlink());
    let follows_link = match op {
        DeltaOperation::Add { kind, .. } => *kind == EntryKind::Directory,
        DeltaOperation::Modify { mode, .. } => mode.is_some(),
        DeltaOperation::SetMode { .. } => true,
        DeltaOperation::Delete { .. } => false,
    };
    if is_link && follows_link {
        return Err(PatchError::Unsupported(format!(
            "{} is a symlink in the base bundle",
            op.path()
        )));
    }

    match op {
        DeltaOperation::Add {
            path,
            kind,
            payload: payload_id,
            target: link_target,
            mode,
            digest,
        } => {
            if existing.is_some() && *kind != EntryKind::Directory {
                return Err(PatchError::Corrupt(format!("{} already exists", path)));
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            match kind {
                EntryKind::Directory => fs::create_dir_all(&target)?,
                EntryKind::File => {
                    let id = payload_id.as_deref().ok_or_else(|| {
                        PatchError::Unsupported(format!("no payload for {}", path))
                    })?;
                    let data = payload(archive, id)?;
                    if let Some(expected) = digest {
                        let actual = hex::encode(TrustVerifier::sha256(data));
                        expect_digest(&actual, expected, "added file", path)?;
                    }
                    fs::write(&target, data)?;
                }
                EntryKind::Symlink => {
                    let link = link_target.as_deref().ok_or_else(|| {
                        PatchError::Unsupported(format!("no target for {}", path))
                    })?;
                    create_symlink(link, &target)?;
                }
            }
            if let (Some(mode), false) = (mode, *kind == EntryKind::Symlink) {
                set_mode(&target, *mode)?;
            }
        }

        DeltaOperation::Delete { path, digest } => {
            let Some(meta) = existing else {
                return Err(PatchError::Corrupt(format!("{} missing from base", path)));
            };
            if meta.is_dir() {
                fs::remove_dir_all(&target)?;
            } else {
                if let (Some(expected), true) = (digest, meta.is_file()) {
                    expect_digest(&file_digest(&target)?, expected, "deleted file", path)?;
                }
                fs::remove_file(&target)?;
            }
        }

        DeltaOperation::Modify {
            path,
            base_digest,
            payload: payload_id,
            digest,
            mode,
        } => {
            match existing {
                Some(meta) if meta.is_file() => {}
                _ => return Err(PatchError::Corrupt(format!("{} missing from base", path))),
            }
            let old = fs::read(&target)?;
            let actual = hex::encode(TrustVerifier::sha256(&old));
            expect_digest(&actual, base_digest, "base file", path)?;

            let diff = payload(archive, payload_id)?;
            let mut new = Vec::new();
            bsdiff::patch(&old, &mut &diff[..], &mut new)
                .map_err(|e| PatchError::Corrupt(format!("bad diff for {}: {}", path, e)))?;
            let actual = hex::encode(TrustVerifier::sha256(&new));
            expect_digest(&actual, digest, "patched file", path)?;

            fs::write(&target, &new)?;
            if let Some(mode) = mode {
                set_mode(&target, *mode)?;
            }
        }

        DeltaOperation::SetMode { path, mode } => {
            if existing.is_none() {
                return Err(PatchError::Corrupt(format!("{} missing from base", path)));
            }
            set_mode(&target, *mode)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link: &str, at: &Path) -> Result<(), PatchError> {
    std::os::unix::fs::symlink(link, at)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(_link: &str, at: &Path) -> Result<(), PatchError> {
    Err(PatchError::Unsupported(format!(
        "symlinks are not supported on this platform: {:?}",
        at
    )))
}
