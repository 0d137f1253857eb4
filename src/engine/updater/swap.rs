//! Bundle Swap
//!
//! Replaces the installed bundle with a staged one using renames inside the
//! install directory, so at every instant either the old or the new bundle
//! sits at the install path. A small journal per bundle lets `recover` undo
//! a swap interrupted by a crash.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::error::SwapError;
use super::patch::tree::copy_tree;
use crate::engine::locks::bundle_key;

pub const JOURNAL_PREFIX: &str = "swap-journal-";
pub const JOURNAL_SUFFIX: &str = ".json";
/// Appended to a journal that recovery could not act on.
pub const FAILED_SUFFIX: &str = ".failed";

/// Rename primitive, replaceable to inject failures.
pub trait Renamer: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdRenamer;

impl Renamer for StdRenamer {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

/// Sibling paths used during a swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapPaths {
    pub installed: PathBuf,
    pub incoming: PathBuf,
    pub previous: PathBuf,
}

impl SwapPaths {
    pub fn for_installed(installed: &Path) -> Result<Self, SwapError> {
        let parent = installed
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| SwapError::NoParent(installed.to_path_buf()))?;
        let name = installed
            .file_name()
            .ok_or_else(|| SwapError::NoParent(installed.to_path_buf()))?
            .to_string_lossy();
        Ok(Self {
            installed: installed.to_path_buf(),
            incoming: parent.join(format!(".{}.incoming", name)),
            previous: parent.join(format!(".{}.previous", name)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapPhase {
    /// New bundle sits at `incoming`; installed bundle untouched.
    Prepared,
    /// Installed bundle moved to `previous`; install path may be empty.
    InstalledMoved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapJournal {
    pub paths: SwapPaths,
    pub phase: SwapPhase,
    pub started_at: DateTime<Utc>,
}

/// Result of a completed swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapOutcome {
    pub installed: PathBuf,
    /// The replaced bundle, kept until the caller discards it.
    pub previous: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    NothingToDo,
    /// Previous bundle moved back to the install path.
    Restored(PathBuf),
    /// A bundle was already at the install path; leftovers were removed.
    Intact(PathBuf),
}

/// Performs swaps and recovers interrupted ones.
pub struct BundleSwapper {
    renamer: Arc<dyn Renamer>,
    journal_dir: PathBuf,
}

impl BundleSwapper {
    pub fn new(journal_dir: impl Into<PathBuf>) -> Self {
        Self {
            renamer: Arc::new(StdRenamer),
            journal_dir: journal_dir.into(),
        }
    }

    pub fn with_renamer(mut self, renamer: Arc<dyn Renamer>) -> Self {
        self.renamer = renamer;
        self
    }

    /// Journal for one bundle, keyed like its install lock.
    pub fn journal_path(&self, installed: &Path) -> PathBuf {
        self.journal_dir.join(format!(
            "{}{}{}",
            JOURNAL_PREFIX,
            bundle_key(installed),
            JOURNAL_SUFFIX
        ))
    }

    /// Journals of swaps that never finished, in file name order.
    pub fn pending(&self) -> Result<Vec<SwapJournal>, SwapError> {
        let entries = match fs::read_dir(&self.journal_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            if let Some(name) = name {
                if name.starts_with(JOURNAL_PREFIX) && name.ends_with(JOURNAL_SUFFIX) {
                    paths.push(path);
                }
            }
        }
        paths.sort();

        let mut journals = Vec::new();
        for path in paths {
            match read_journal_file(&path) {
                Ok(Some(journal)) => journals.push(journal),
                Ok(None) => {}
                Err(e) => warn!("Ignoring unreadable swap journal {:?}: {}", path, e),
            }
        }
        Ok(journals)
    }

    /// Replace `installed` with `staged`.
    ///
    /// On error the installed bundle is left as it was, except for
    /// `SwapError::RollbackFailed`, where the journal is kept for `recover`.
    pub fn swap(&self, staged: &Path, installed: &Path) -> Result<SwapOutcome, SwapError> {
        if fs::symlink_metadata(staged).is_err() {
            return Err(SwapError::StagedMissing(staged.to_path_buf()));
        }
        let paths = SwapPaths::for_installed(installed)?;
        remove_if_exists(&paths.incoming)?;
        remove_if_exists(&paths.previous)?;

        self.move_into_place(staged, &paths.incoming)?;

        let journal_path = self.journal_path(installed);
        let mut journal = SwapJournal {
            paths: paths.clone(),
            phase: SwapPhase::Prepared,
            started_at: Utc::now(),
        };
        if let Err(e) = self.write_journal(&journal_path, &journal) {
            let _ = remove_if_exists(&paths.incoming);
            return Err(e);
        }

        let had_previous = fs::symlink_metadata(installed).is_ok();
        if had_previous {
            if let Err(e) = self.renamer.rename(installed, &paths.previous) {
                error!("Failed to move installed bundle aside: {}", e);
                let _ = remove_if_exists(&paths.incoming);
                clear_journal(&journal_path);
                return Err(SwapError::Io(e));
            }
            journal.phase = SwapPhase::InstalledMoved;
            if let Err(e) = self.write_journal(&journal_path, &journal) {
                // Journal still says Prepared; recover would not restore, so
                // undo right here.
                warn!("Failed to update swap journal: {}", e);
                let cause = SwapError::Journal(e.to_string());
                return Err(self.roll_back(&paths, &journal_path, cause));
            }
        }

        if let Err(e) = self.renamer.rename(&paths.incoming, installed) {
            error!("Failed to move new bundle into place: {}", e);
            if !had_previous {
                let _ = remove_if_exists(&paths.incoming);
                clear_journal(&journal_path);
                return Err(SwapError::Io(e));
            }
            return Err(self.roll_back(&paths, &journal_path, SwapError::Io(e)));
        }

        clear_journal(&journal_path);
        info!("Swapped new bundle into {:?}", installed);
        Ok(SwapOutcome {
            installed: installed.to_path_buf(),
            previous: had_previous.then(|| paths.previous.clone()),
        })
    }

    /// Delete the bundle a swap replaced.
    pub fn discard_previous(&self, outcome: &SwapOutcome) -> io::Result<()> {
        match &outcome.previous {
            Some(previous) => remove_if_exists(previous),
            None => Ok(()),
        }
    }

    /// Finish or undo an interrupted swap of `installed`. The caller holds
    /// the bundle's install lock.
    ///
    /// A journal whose bundle and backup are both gone is renamed with a
    /// `.failed` suffix and no longer counts as pending.
    pub fn recover(&self, installed: &Path) -> Result<RecoveryAction, SwapError> {
        let journal_path = self.journal_path(installed);
        let Some(journal) = read_journal_file(&journal_path)? else {
            return Ok(RecoveryAction::NothingToDo);
        };
        let paths = &journal.paths;
        let installed_present = fs::symlink_metadata(&paths.installed).is_ok();
        let previous_present = fs::symlink_metadata(&paths.previous).is_ok();

        let action = if installed_present {
            match journal.phase {
                SwapPhase::Prepared => remove_if_exists(&paths.incoming)?,
                SwapPhase::InstalledMoved => remove_if_exists(&paths.previous)?,
            }
            RecoveryAction::Intact(paths.installed.clone())
        } else if previous_present {
            warn!(
                "Restoring {:?} from interrupted swap started at {}",
                paths.installed, journal.started_at
            );
            self.renamer.rename(&paths.previous, &paths.installed)?;
            remove_if_exists(&paths.incoming)?;
            RecoveryAction::Restored(paths.installed.clone())
        } else {
            let failed = set_aside(&journal_path);
            error!(
                "Cannot recover {:?}: neither it nor its backup exist (journal kept at {:?})",
                paths.installed, failed
            );
            return Err(SwapError::Journal(format!(
                "neither {:?} nor its backup exist",
                paths.installed
            )));
        };

        clear_journal(&journal_path);
        Ok(action)
    }

    fn move_into_place(&self, staged: &Path, incoming: &Path) -> Result<(), SwapError> {
        match self.renamer.rename(staged, incoming) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Typically a staging dir on another filesystem.
                debug!("Rename of staged bundle failed ({}), copying instead", e);
                if let Err(copy_err) = copy_tree(staged, incoming) {
                    let _ = remove_if_exists(incoming);
                    return Err(SwapError::Io(copy_err));
                }
                if let Err(cleanup) = remove_if_exists(staged) {
                    warn!("Failed to remove staged bundle {:?}: {}", staged, cleanup);
                }
                Ok(())
            }
        }
    }

    fn roll_back(&self, paths: &SwapPaths, journal_path: &Path, cause: SwapError) -> SwapError {
        match self.renamer.rename(&paths.previous, &paths.installed) {
            Ok(()) => {
                info!("Rolled back to previous bundle at {:?}", paths.installed);
                let _ = remove_if_exists(&paths.incoming);
                clear_journal(journal_path);
                cause
            }
            Err(rollback) => {
                error!("Rollback failed: {}", rollback);
                SwapError::RollbackFailed {
                    rollback: rollback.to_string(),
                    backup: paths.previous.clone(),
                }
            }
        }
    }

    fn write_journal(&self, path: &Path, journal: &SwapJournal) -> Result<(), SwapError> {
        fs::create_dir_all(&self.journal_dir)?;
        let content =
            serde_json::to_string_pretty(journal).map_err(|e| SwapError::Journal(e.to_string()))?;

        // Write to temp file first, then rename
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

fn read_journal_file(path: &Path) -> Result<Option<SwapJournal>, SwapError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| SwapError::Journal(e.to_string()))
}

fn clear_journal(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove swap journal: {}", e);
        }
    }
}

/// Move a journal out of the pending set, returning its new location.
fn set_aside(path: &Path) -> PathBuf {
    let mut failed = path.as_os_str().to_owned();
    failed.push(FAILED_SUFFIX);
    let failed = PathBuf::from(failed);
    if let Err(e) = fs::rename(path, &failed) {
        warn!("Failed to set aside swap journal {:?}: {}", path, e);
    }
    failed
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Fails the n-th rename call (0-based), delegating the rest.
    struct FailingRenamer {
        fail_on: usize,
        calls: AtomicUsize,
    }

    impl FailingRenamer {
        fn new(fail_on: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_on,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Renamer for FailingRenamer {
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected"));
            }
            fs::rename(from, to)
        }
    }

    fn bundle(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("marker"), content).unwrap();
        path
    }

    fn marker(path: &Path) -> String {
        fs::read_to_string(path.join("marker")).unwrap()
    }

    #[test]
    fn test_swap_replaces_installed() {
        let dir = tempdir().unwrap();
        let installed = bundle(&dir.path().join("apps"), "App", "old");
        let staged = bundle(&dir.path().join("staging"), "App", "new");
        let swapper = BundleSwapper::new(dir.path().join("state"));

        let outcome = swapper.swap(&staged, &installed).unwrap();
        assert_eq!(marker(&installed), "new");
        assert!(!staged.exists());
        let previous = outcome.previous.clone().unwrap();
        assert_eq!(marker(&previous), "old");
        assert!(!swapper.journal_path(&installed).exists());

        swapper.discard_previous(&outcome).unwrap();
        assert!(!previous.exists());
    }

    #[test]
    fn test_swap_into_empty_location() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("apps")).unwrap();
        let installed = dir.path().join("apps/App");
        let staged = bundle(&dir.path().join("staging"), "App", "new");

        let outcome = BundleSwapper::new(dir.path().join("state"))
            .swap(&staged, &installed)
            .unwrap();
        assert_eq!(marker(&installed), "new");
        assert!(outcome.previous.is_none());
    }

    #[test]
    fn test_rename_faults_keep_original() {
        // Renames: staged->incoming, installed->previous, incoming->installed.
        for fail_on in 1..3 {
            let dir = tempdir().unwrap();
            let installed = bundle(&dir.path().join("apps"), "App", "old");
            let staged = bundle(&dir.path().join("staging"), "App", "new");
            let swapper = BundleSwapper::new(dir.path().join("state"))
                .with_renamer(FailingRenamer::new(fail_on));

            let result = swapper.swap(&staged, &installed);
            assert!(result.is_err(), "fault at rename {}", fail_on);
            assert_eq!(marker(&installed), "old", "fault at rename {}", fail_on);
            let paths = SwapPaths::for_installed(&installed).unwrap();
            assert!(!paths.incoming.exists());
            assert!(!paths.previous.exists());
            assert!(!swapper.journal_path(&installed).exists());
        }
    }

    #[test]
    fn test_failed_first_rename_falls_back_to_copy() {
        let dir = tempdir().unwrap();
        let installed = bundle(&dir.path().join("apps"), "App", "old");
        let staged = bundle(&dir.path().join("staging"), "App", "new");
        let swapper =
            BundleSwapper::new(dir.path().join("state")).with_renamer(FailingRenamer::new(0));

        swapper.swap(&staged, &installed).unwrap();
        assert_eq!(marker(&installed), "new");
        assert!(!staged.exists());
    }

    #[test]
    fn test_missing_staged_bundle() {
        let dir = tempdir().unwrap();
        let installed = bundle(&dir.path().join("apps"), "App", "old");
        let result = BundleSwapper::new(dir.path().join("state"))
            .swap(&dir.path().join("nope"), &installed);
        assert!(matches!(result, Err(SwapError::StagedMissing(_))));
        assert_eq!(marker(&installed), "old");
    }

    #[test]
    fn test_recover_restores_after_crash() {
        let dir = tempdir().unwrap();
        let installed = bundle(&dir.path().join("apps"), "App", "old");
        let paths = SwapPaths::for_installed(&installed).unwrap();
        let swapper = BundleSwapper::new(dir.path().join("state"));

        // Simulate a crash between moving the old bundle aside and moving the
        // new one in.
        bundle(&dir.path().join("apps"), ".App.incoming", "new");
        fs::rename(&installed, &paths.previous).unwrap();
        swapper
            .write_journal(
                &swapper.journal_path(&installed),
                &SwapJournal {
                    paths: paths.clone(),
                    phase: SwapPhase::InstalledMoved,
                    started_at: Utc::now(),
                },
            )
            .unwrap();
        assert_eq!(swapper.pending().unwrap().len(), 1);

        let action = swapper.recover(&installed).unwrap();
        assert_eq!(action, RecoveryAction::Restored(installed.clone()));
        assert_eq!(marker(&installed), "old");
        assert!(!paths.incoming.exists());
        assert!(!swapper.journal_path(&installed).exists());

        assert_eq!(swapper.recover(&installed).unwrap(), RecoveryAction::NothingToDo);
        assert!(swapper.pending().unwrap().is_empty());
    }

    #[test]
    fn test_recover_after_prepared_crash_discards_incoming() {
        let dir = tempdir().unwrap();
        let installed = bundle(&dir.path().join("apps"), "App", "old");
        let paths = SwapPaths::for_installed(&installed).unwrap();
        let swapper = BundleSwapper::new(dir.path().join("state"));

        bundle(&dir.path().join("apps"), ".App.incoming", "new");
        swapper
            .write_journal(
                &swapper.journal_path(&installed),
                &SwapJournal {
                    paths: paths.clone(),
                    phase: SwapPhase::Prepared,
                    started_at: Utc::now(),
                },
            )
            .unwrap();

        assert_eq!(
            swapper.recover(&installed).unwrap(),
            RecoveryAction::Intact(installed.clone())
        );
        assert_eq!(marker(&installed), "old");
        assert!(!paths.incoming.exists());
    }

    #[test]
    fn test_journals_are_per_bundle() {
        let dir = tempdir().unwrap();
        let a = bundle(&dir.path().join("apps"), "A", "a");
        let b = bundle(&dir.path().join("apps"), "B", "b");
        let swapper = BundleSwapper::new(dir.path().join("state"));

        assert_ne!(swapper.journal_path(&a), swapper.journal_path(&b));
        assert_eq!(
            swapper.journal_path(&a),
            swapper.journal_path(&dir.path().join("apps/../apps/A"))
        );

        let paths = SwapPaths::for_installed(&a).unwrap();
        bundle(&dir.path().join("apps"), ".A.incoming", "new");
        swapper
            .write_journal(
                &swapper.journal_path(&a),
                &SwapJournal {
                    paths: paths.clone(),
                    phase: SwapPhase::Prepared,
                    started_at: Utc::now(),
                },
            )
            .unwrap();

        // Another bundle's recovery leaves A's journal alone
        assert_eq!(swapper.recover(&b).unwrap(), RecoveryAction::NothingToDo);
        assert!(paths.incoming.exists());
        assert!(swapper.journal_path(&a).exists());
        assert_eq!(marker(&b), "b");
    }

    #[test]
    fn test_unrecoverable_journal_is_set_aside() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("apps")).unwrap();
        let installed = dir.path().join("apps/App");
        let swapper = BundleSwapper::new(dir.path().join("state"));
        let journal_path = swapper.journal_path(&installed);

        swapper
            .write_journal(
                &journal_path,
                &SwapJournal {
                    paths: SwapPaths::for_installed(&installed).unwrap(),
                    phase: SwapPhase::InstalledMoved,
                    started_at: Utc::now(),
                },
            )
            .unwrap();

        assert!(matches!(
            swapper.recover(&installed),
            Err(SwapError::Journal(_))
        ));
        assert!(!journal_path.exists());
        let mut failed = journal_path.as_os_str().to_owned();
        failed.push(FAILED_SUFFIX);
        assert!(PathBuf::from(failed).exists());

        // Reported once; later runs see nothing pending
        assert!(swapper.pending().unwrap().is_empty());
        assert_eq!(swapper.recover(&installed).unwrap(), RecoveryAction::NothingToDo);
    }
}
