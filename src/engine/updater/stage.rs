//! Full Artifact Staging
//!
//! Extracts a downloaded archive into a private directory and locates the
//! single bundle inside it.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info};

use super::cancel::CancellationHandle;
use super::error::StageError;
use super::patch::tree::{link_escapes, set_mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
}

impl ArchiveFormat {
    /// Detect the format from the file name.
    pub fn detect(path: &Path) -> Result<Self, StageError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if name.ends_with(".tar") {
            Ok(Self::Tar)
        } else if name.ends_with(".zip") {
            Ok(Self::Zip)
        } else {
            Err(StageError::UnsupportedArchive(name))
        }
    }
}

/// Extract `archive` into `dest` and return the path of the bundle it holds.
pub fn stage_archive(
    archive: &Path,
    dest: &Path,
    cancel: &CancellationHandle,
) -> Result<PathBuf, StageError> {
    let format = ArchiveFormat::detect(archive)?;
    fs::create_dir_all(dest)?;
    info!("Extracting {:?} ({:?})", archive, format);

    match format {
        ArchiveFormat::TarGz => {
            extract_tar(tar::Archive::new(GzDecoder::new(File::open(archive)?)), dest, cancel)?
        }
        ArchiveFormat::Tar => extract_tar(tar::Archive::new(File::open(archive)?), dest, cancel)?,
        ArchiveFormat::Zip => extract_zip(File::open(archive)?, dest, cancel)?,
    }

    locate_bundle(dest)
}

fn check_cancel(cancel: &CancellationHandle) -> Result<(), StageError> {
    if cancel.is_cancelled() {
        Err(StageError::Cancelled)
    } else {
        Ok(())
    }
}

fn extract_tar<R: io::Read>(
    mut archive: tar::Archive<R>,
    dest: &Path,
    cancel: &CancellationHandle,
) -> Result<(), StageError> {
    archive.set_preserve_permissions(true);
    for entry in archive.entries().map_err(archive_error)? {
        check_cancel(cancel)?;
        let mut entry = entry.map_err(archive_error)?;
        if entry.header().entry_type().is_symlink() {
            let path = entry.path().map_err(archive_error)?.into_owned();
            let link = entry
                .link_name()
                .map_err(archive_error)?
                .map(|l| l.to_string_lossy().into_owned())
                .unwrap_or_default();
            check_link_target(&path, &link)?;
        }
        // unpack_in refuses entries that would land outside `dest`
        let unpacked = entry.unpack_in(dest).map_err(archive_error)?;
        if !unpacked {
            debug!("Skipped unsafe archive entry {:?}", entry.path().ok());
        }
    }
    Ok(())
}

fn extract_zip(file: File, dest: &Path, cancel: &CancellationHandle) -> Result<(), StageError> {
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| StageError::Archive(e.to_string()))?;

    for index in 0..archive.len() {
        check_cancel(cancel)?;
        let mut entry = archive
            .by_index(index)
            .map_err(|e| StageError::Archive(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            debug!("Skipped unsafe archive entry {}", entry.name());
            continue;
        };
        check_no_symlink_on_path(dest, &relative)?;
        let target = dest.join(&relative);
        let mode = entry.unix_mode();

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if mode.map_or(false, |m| m & 0o170000 == 0o120000) {
            let mut link = String::new();
            io::Read::read_to_string(&mut entry, &mut link)?;
            check_link_target(&relative, &link)?;
            create_symlink(&link, &target)?;
            continue;
        }

        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        if let Some(mode) = mode {
            set_mode(&target, mode & 0o7777)?;
        }
    }
    Ok(())
}

/// Refuse an entry that would be written through a symlink created by an
/// earlier entry, or on top of one.
fn check_no_symlink_on_path(dest: &Path, relative: &Path) -> Result<(), StageError> {
    let mut current = dest.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(StageError::Archive(format!(
                    "entry {} passes through symlink {}",
                    relative.display(),
                    current.display()
                )))
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Symlinks must stay inside the bundle they belong to. `entry` is the
/// archive path, whose first component is the bundle itself.
fn check_link_target(entry: &Path, link: &str) -> Result<(), StageError> {
    let within_bundle: PathBuf = entry
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .skip(1)
        .collect();
    if within_bundle.as_os_str().is_empty() || link_escapes(&within_bundle, link) {
        return Err(StageError::Archive(format!(
            "symlink {} points outside the bundle: {}",
            entry.display(),
            link
        )));
    }
    Ok(())
}

/// The single top-level directory in `dir`, ignoring hidden entries and
/// resource-fork folders.
pub fn locate_bundle(dir: &Path) -> Result<PathBuf, StageError> {
    let mut bundles = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == "__MACOSX" {
            continue;
        }
        bundles.push(entry.path());
    }
    if bundles.len() != 1 || !bundles[0].is_dir() {
        return Err(StageError::BundleLayout(bundles.len()));
    }
    Ok(bundles.remove(0))
}

fn archive_error(err: io::Error) -> StageError {
    StageError::Archive(err.to_string())
}

#[cfg(unix)]
fn create_symlink(link: &str, at: &Path) -> Result<(), StageError> {
    std::os::unix::fs::symlink(link, at)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(link: &str, at: &Path) -> Result<(), StageError> {
    debug!("Skipping symlink {:?} -> {} on this platform", at, link);
    Ok(())
}
