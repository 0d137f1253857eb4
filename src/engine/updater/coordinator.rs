//! Installation Coordinator
//!
//! Drives one installation attempt through verification, staging,
//! authorization, the swap and post-processing. Every attempt ends in
//! `Done` or `Failed(reason)`; the installed bundle is only replaced by the
//! swap itself and survives every failure before or during it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cancel::CancellationHandle;
use super::channel::{PrivilegedChannel, PrivilegedRequest};
use super::error::{
    ChannelError, FailureReason, InstallError, PatchError, StageError, SwapError,
};
use super::feed::{ArtifactDescriptor, CandidateRecord, SignatureSet};
use super::fetch::ArtifactFetcher;
use super::identity::{BundleInfo, IdentityInspector, ManifestInspector};
use super::patch::PatchApplier;
use super::selector::SelectionDecision;
use super::stage::stage_archive;
use super::state::{IllegalTransition, InstallStateMachine, InstallationState, StateTransition};
use super::swap::{BundleSwapper, RecoveryAction, Renamer, StdRenamer, SwapOutcome};
use super::verify::TrustVerifier;
use super::version::compare_versions;
use crate::engine::locks::{InstallLocks, LockError};
use crate::engine::platform;

/// Knobs of the installer, usually derived from `UpdaterConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerSettings {
    pub authorization_timeout: Duration,
    /// Holds the swap journal, install locks and per-attempt staging dirs.
    pub state_dir: PathBuf,
    pub clear_quarantine: bool,
    pub refresh_index: bool,
}

impl InstallerSettings {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            authorization_timeout: Duration::from_secs(120),
            state_dir: state_dir.into(),
            clear_quarantine: true,
            refresh_index: true,
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir.join("staging")
    }
}

/// What to install and where.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub decision: SelectionDecision,
    pub installed: PathBuf,
}

impl InstallPlan {
    pub fn new(decision: SelectionDecision, installed: impl Into<PathBuf>) -> Self {
        Self {
            decision,
            installed: installed.into(),
        }
    }
}

/// Result of a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    pub version: String,
    pub installed: PathBuf,
    /// `Done` or `Failed(reason)`
    pub outcome: InstallationState,
    pub history: Vec<StateTransition>,
    pub used_full_fallback: bool,
    pub warnings: Vec<String>,
}

impl InstallReport {
    pub fn is_success(&self) -> bool {
        self.outcome == InstallationState::Done
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.outcome {
            InstallationState::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

enum Fetched {
    Delta(PathBuf),
    Full(PathBuf),
}

enum AttemptError {
    Failed(FailureReason),
    State(IllegalTransition),
}

impl From<FailureReason> for AttemptError {
    fn from(reason: FailureReason) -> Self {
        Self::Failed(reason)
    }
}

impl From<IllegalTransition> for AttemptError {
    fn from(err: IllegalTransition) -> Self {
        Self::State(err)
    }
}

/// Mutable bookkeeping of a running attempt.
struct Attempt<'a> {
    plan: &'a InstallPlan,
    candidate: &'a CandidateRecord,
    cancel: &'a CancellationHandle,
    work_dir: PathBuf,
    machine: InstallStateMachine,
    used_full_fallback: bool,
    warnings: Vec<String>,
}

impl Attempt<'_> {
    fn enter(&mut self, state: InstallationState) -> Result<(), AttemptError> {
        if self.cancel.is_cancelled() {
            return Err(FailureReason::Cancelled.into());
        }
        self.machine.transition(state)?;
        Ok(())
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Runs installation attempts with injected collaborators.
pub struct InstallationCoordinator {
    verifier: Arc<TrustVerifier>,
    fetcher: Arc<dyn ArtifactFetcher>,
    channel: Arc<dyn PrivilegedChannel>,
    inspector: Arc<dyn IdentityInspector>,
    renamer: Arc<dyn Renamer>,
    applier: PatchApplier,
    settings: InstallerSettings,
}

impl InstallationCoordinator {
    pub fn new(
        verifier: TrustVerifier,
        fetcher: Arc<dyn ArtifactFetcher>,
        channel: Arc<dyn PrivilegedChannel>,
        settings: InstallerSettings,
    ) -> Self {
        Self {
            verifier: Arc::new(verifier),
            fetcher,
            channel,
            inspector: Arc::new(ManifestInspector),
            renamer: Arc::new(StdRenamer),
            applier: PatchApplier::new(),
            settings,
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn IdentityInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_renamer(mut self, renamer: Arc<dyn Renamer>) -> Self {
        self.renamer = renamer;
        self
    }

    pub fn settings(&self) -> &InstallerSettings {
        &self.settings
    }

    fn swapper(&self) -> BundleSwapper {
        BundleSwapper::new(self.settings.state_dir.clone()).with_renamer(self.renamer.clone())
    }

    /// Finish or undo every swap a previous process left half done.
    pub fn recover_all(&self) -> Result<Vec<RecoveryReport>, InstallError> {
        let locks = InstallLocks::new(&self.settings.state_dir);
        recover_interrupted(&self.swapper(), &locks)
    }

    /// Run one installation attempt.
    ///
    /// `Err` is only returned when the attempt cannot start (nothing to
    /// install, bundle busy). Failures during the attempt are reported in
    /// the returned `InstallReport`.
    pub async fn install(
        &self,
        plan: &InstallPlan,
        cancel: &CancellationHandle,
    ) -> Result<InstallReport, InstallError> {
        let candidate = plan.decision.candidate().ok_or(InstallError::NoUpdate)?;

        let locks = InstallLocks::new(&self.settings.state_dir);
        let _guard = locks.acquire(&plan.installed).map_err(|e| match e {
            LockError::AlreadyLocked { bundle, .. } => InstallError::Busy(bundle),
            other => InstallError::Lock(other),
        })?;

        match self.swapper().recover(&plan.installed) {
            Ok(RecoveryAction::NothingToDo) => {}
            Ok(action) => info!("Recovered interrupted swap: {:?}", action),
            Err(e) => warn!("Swap recovery failed: {}", e),
        }

        let work_dir = self
            .settings
            .staging_dir()
            .join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&work_dir).await?;

        info!(
            "Installing {} into {:?} ({})",
            candidate.version,
            plan.installed,
            if plan.decision.delta().is_some() { "delta" } else { "full" }
        );

        let mut attempt = Attempt {
            plan,
            candidate,
            cancel,
            work_dir: work_dir.clone(),
            machine: InstallStateMachine::new(),
            used_full_fallback: false,
            warnings: Vec::new(),
        };

        let result = self.run(&mut attempt).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                attempt.warn(format!("Failed to clean up {:?}: {}", work_dir, e));
            }
        }

        match result {
            Ok(()) => {}
            Err(AttemptError::Failed(reason)) => {
                attempt.machine.fail(reason)?;
            }
            Err(AttemptError::State(e)) => return Err(e.into()),
        }

        Ok(InstallReport {
            version: candidate.version.clone(),
            installed: plan.installed.clone(),
            outcome: attempt.machine.current().clone(),
            history: attempt.machine.into_history(),
            used_full_fallback: attempt.used_full_fallback,
            warnings: attempt.warnings,
        })
    }

    async fn run(&self, attempt: &mut Attempt<'_>) -> Result<(), AttemptError> {
        if attempt.cancel.is_cancelled() {
            return Err(FailureReason::Cancelled.into());
        }

        // Verifying
        let fetched = match attempt.plan.decision.delta() {
            Some(delta) => Fetched::Delta(
                self.fetch_verified(attempt, &delta.artifact, &delta.signatures)
                    .await?,
            ),
            None => {
                let candidate = attempt.candidate;
                Fetched::Full(
                    self.fetch_verified(attempt, &candidate.artifact, &candidate.signatures)
                        .await?,
                )
            }
        };

        // Staging
        attempt.enter(InstallationState::Staging)?;
        let staged = match fetched {
            Fetched::Delta(patch) => match self.apply_patch(attempt, &patch).await {
                Ok(staged) => staged,
                Err(PatchError::Cancelled) => return Err(FailureReason::Cancelled.into()),
                Err(e) => {
                    warn!("Delta could not be applied ({}), falling back to full update", e);
                    attempt.used_full_fallback = true;
                    let candidate = attempt.candidate;
                    let archive = self
                        .fetch_verified(attempt, &candidate.artifact, &candidate.signatures)
                        .await?;
                    self.stage_full(attempt, &archive).await?
                }
            },
            Fetched::Full(archive) => self.stage_full(attempt, &archive).await?,
        };
        self.check_identity(attempt, &staged)?;

        // AwaitingAuthorization
        attempt.enter(InstallationState::AwaitingAuthorization)?;
        let elevated = self.authorize(attempt).await?;

        // Swapping
        if !attempt.cancel.commit() {
            return Err(FailureReason::Cancelled.into());
        }
        attempt.enter(InstallationState::Swapping)?;
        let outcome = self.swap(attempt, &staged, elevated).await?;

        // PostProcessing
        attempt.enter(InstallationState::PostProcessing)?;
        self.post_process(attempt, outcome.as_ref()).await;

        attempt.machine.transition(InstallationState::Done)?;
        info!("Installed {} at {:?}", attempt.candidate.version, attempt.plan.installed);
        Ok(())
    }

    /// Fetch an artifact and check it against its signatures and declared
    /// length/hash. Anything short of `Trusted` ends the attempt.
    async fn fetch_verified(
        &self,
        attempt: &Attempt<'_>,
        artifact: &ArtifactDescriptor,
        signatures: &SignatureSet,
    ) -> Result<PathBuf, FailureReason> {
        let dest = attempt.work_dir.join("downloads");
        let path = until_cancelled(attempt.cancel, self.fetcher.fetch(artifact, &dest))
            .await?
            .map_err(|e| FailureReason::FetchFailed(e.to_string()))?;

        let verifier = self.verifier.clone();
        let check_path = path.clone();
        let (artifact, signatures) = (artifact.clone(), signatures.clone());
        let verdict = tokio::task::spawn_blocking(move || {
            verifier.verify_download(&check_path, &artifact, &signatures)
        })
        .await
        .map_err(|e| FailureReason::Unverifiable(e.to_string()))?
        .map_err(|e| FailureReason::Unverifiable(format!("cannot read artifact: {}", e)))?;

        debug!("Verdict for {:?}: {:?}", path, verdict);
        match verdict.failure() {
            Some(reason) => Err(reason),
            None => Ok(path),
        }
    }

    async fn apply_patch(
        &self,
        attempt: &Attempt<'_>,
        patch: &Path,
    ) -> Result<PathBuf, PatchError> {
        let applier = self.applier;
        let base = attempt.plan.installed.clone();
        let patch = patch.to_path_buf();
        let staging_root = attempt.work_dir.join("patched");
        let cancel = attempt.cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut progress = |done: usize, total: usize| {
                debug!("Patch progress {}/{}", done, total);
            };
            applier.apply_with_progress(&base, &patch, &staging_root, &cancel, &mut progress)
        })
        .await
        .map_err(|e| PatchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
    }

    async fn stage_full(
        &self,
        attempt: &Attempt<'_>,
        archive: &Path,
    ) -> Result<PathBuf, FailureReason> {
        let archive = archive.to_path_buf();
        let dest = attempt.work_dir.join("extracted");
        let cancel = attempt.cancel.clone();
        let staged = tokio::task::spawn_blocking(move || stage_archive(&archive, &dest, &cancel))
            .await
            .map_err(|e| FailureReason::StagingFailed(e.to_string()))?;
        match staged {
            Ok(path) => Ok(path),
            Err(StageError::Cancelled) => Err(FailureReason::Cancelled),
            Err(e) => Err(FailureReason::StagingFailed(e.to_string())),
        }
    }

    /// The staged bundle must carry the candidate's version and continue the
    /// installed bundle's identity.
    fn check_identity(&self, attempt: &Attempt<'_>, staged: &Path) -> Result<(), FailureReason> {
        let installed = &attempt.plan.installed;
        let previous: Option<BundleInfo> = if installed.exists() {
            Some(self.inspector.inspect(installed).map_err(|e| {
                FailureReason::Unverifiable(format!("cannot read installed bundle identity: {}", e))
            })?)
        } else {
            None
        };
        let candidate = self.inspector.inspect(staged).map_err(|e| {
            FailureReason::Unverifiable(format!("cannot read staged bundle identity: {}", e))
        })?;

        if compare_versions(&candidate.version, &attempt.candidate.version).is_ne() {
            return Err(FailureReason::Untrusted(format!(
                "staged bundle is version {}, expected {}",
                candidate.version, attempt.candidate.version
            )));
        }

        match self.verifier.verify_continuity(previous.as_ref(), &candidate).failure() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Ask for elevated access when the install location is not writable.
    /// Returns whether the swap has to go through the channel.
    async fn authorize(&self, attempt: &Attempt<'_>) -> Result<bool, FailureReason> {
        let destination = attempt
            .plan
            .installed
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        if platform::is_writable(&destination) {
            return Ok(false);
        }

        info!("Requesting elevated access to {:?}", destination);
        let timeout = self.settings.authorization_timeout;
        let request = self
            .channel
            .send(PrivilegedRequest::AcquireElevatedAccess { destination });

        match until_cancelled(attempt.cancel, tokio::time::timeout(timeout, request)).await? {
            Ok(Ok(())) => Ok(true),
            Ok(Err(ChannelError::Timeout)) | Err(_) => {
                Err(FailureReason::AuthorizationTimeout(timeout.as_secs()))
            }
            Ok(Err(e)) => Err(FailureReason::AuthorizationDenied(e.to_string())),
        }
    }

    async fn swap(
        &self,
        attempt: &Attempt<'_>,
        staged: &Path,
        elevated: bool,
    ) -> Result<Option<SwapOutcome>, FailureReason> {
        let installed = attempt.plan.installed.clone();
        if elevated {
            self.channel
                .send(PrivilegedRequest::PerformSwap {
                    staged: staged.to_path_buf(),
                    installed,
                })
                .await
                .map_err(|e| FailureReason::SwapFailed(e.to_string()))?;
            return Ok(None);
        }

        let swapper = self.swapper();
        let staged = staged.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || swapper.swap(&staged, &installed))
            .await
            .map_err(|e| FailureReason::SwapFailed(e.to_string()))?
            .map_err(|e| FailureReason::SwapFailed(e.to_string()))?;
        Ok(Some(outcome))
    }

    /// Non-fatal follow-up work; problems end up as warnings.
    async fn post_process(&self, attempt: &mut Attempt<'_>, outcome: Option<&SwapOutcome>) {
        let bundle = attempt.plan.installed.clone();
        let mut requests = Vec::new();
        if self.settings.clear_quarantine {
            requests.push(PrivilegedRequest::ClearQuarantine {
                bundle: bundle.clone(),
            });
        }
        if self.settings.refresh_index {
            requests.push(PrivilegedRequest::RefreshIndex { bundle });
        }
        for request in requests {
            let name = request.name();
            if let Err(e) = self.channel.send(request).await {
                attempt.warn(format!("Post-processing step {} failed: {}", name, e));
            }
        }

        if let Some(outcome) = outcome {
            if let Err(e) = self.swapper().discard_previous(outcome) {
                attempt.warn(format!("Failed to remove replaced bundle: {}", e));
            }
        }
    }
}

/// Outcome of recovering one bundle's interrupted swap.
#[derive(Debug)]
pub struct RecoveryReport {
    pub bundle: PathBuf,
    pub result: Result<RecoveryAction, SwapError>,
}

/// Recover each bundle with a pending swap journal while holding that
/// bundle's install lock. Bundles whose lock is held are skipped; their
/// installer recovers them itself.
pub fn recover_interrupted(
    swapper: &BundleSwapper,
    locks: &InstallLocks,
) -> Result<Vec<RecoveryReport>, InstallError> {
    let mut reports = Vec::new();
    for journal in swapper.pending()? {
        let bundle = journal.paths.installed;
        let _guard = match locks.acquire(&bundle) {
            Ok(guard) => guard,
            Err(LockError::AlreadyLocked { pid, .. }) => {
                warn!("Skipping recovery of {:?}: locked by PID {}", bundle, pid);
                continue;
            }
            Err(e) => return Err(InstallError::Lock(e)),
        };
        let result = swapper.recover(&bundle);
        match &result {
            Ok(action) => info!("Recovered {:?}: {:?}", bundle, action),
            Err(e) => warn!("Recovery of {:?} failed: {}", bundle, e),
        }
        reports.push(RecoveryReport { bundle, result });
    }
    Ok(reports)
}

async fn until_cancelled<T>(
    cancel: &CancellationHandle,
    work: impl Future<Output = T>,
) -> Result<T, FailureReason> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FailureReason::Cancelled),
        out = work => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::channel::InProcessChannel;
    use crate::engine::updater::fetch::LocalFetcher;
    use crate::engine::updater::swap::{SwapJournal, SwapPaths, SwapPhase};
    use crate::engine::updater::test_utils::{pack_tar_gz, write_bundle, TestSigner};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        signer: TestSigner,
        installed: PathBuf,
    }

    impl Fixture {
        fn new(identity: &str) -> Self {
            let dir = tempdir().unwrap();
            let installed = write_bundle(
                &dir.path().join("apps"),
                "App",
                &BundleInfo::new("com.example.app", "1.1").signed_by(identity),
                &[("bin/app", b"v1.1")],
            )
            .unwrap();
            Self {
                dir,
                signer: TestSigner::new(),
                installed,
            }
        }

        fn candidate(&self, version: &str, identity: &str) -> CandidateRecord {
            let build = write_bundle(
                &self.dir.path().join("build").join(version),
                "App",
                &BundleInfo::new("com.example.app", version).signed_by(identity),
                &[("bin/app", version.as_bytes())],
            )
            .unwrap();
            fs::create_dir_all(self.dir.path().join("feed")).unwrap();
            let archive = self.dir.path().join("feed").join(format!("App-{}.tar.gz", version));
            pack_tar_gz(&build, &archive).unwrap();

            let bytes = fs::read(&archive).unwrap();
            CandidateRecord::new(
                version,
                ArtifactDescriptor::new(archive.display().to_string(), bytes.len() as u64),
            )
            .with_signatures(SignatureSet::modern(self.signer.sign_modern(&bytes)))
        }

        fn coordinator(&self, channel: Arc<dyn PrivilegedChannel>) -> InstallationCoordinator {
            let mut settings = InstallerSettings::new(self.dir.path().join("state"));
            settings.authorization_timeout = Duration::from_millis(100);
            InstallationCoordinator::new(
                self.signer.verifier(),
                Arc::new(LocalFetcher::new()),
                channel,
                settings,
            )
        }

        fn in_process(&self) -> Arc<dyn PrivilegedChannel> {
            Arc::new(InProcessChannel::new(self.dir.path().join("state")))
        }

        fn installed_content(&self) -> String {
            fs::read_to_string(self.installed.join("bin/app")).unwrap()
        }
    }

    /// Denies access, hangs or fails post-processing on demand.
    struct ScriptedChannel {
        access: Option<ChannelError>,
        hang: bool,
        fail_post_processing: bool,
    }

    #[async_trait]
    impl PrivilegedChannel for ScriptedChannel {
        async fn send(&self, request: PrivilegedRequest) -> Result<(), ChannelError> {
            match request {
                PrivilegedRequest::AcquireElevatedAccess { .. } => {
                    if self.hang {
                        std::future::pending::<()>().await;
                    }
                    match &self.access {
                        Some(e) => Err(e.clone()),
                        None => Ok(()),
                    }
                }
                PrivilegedRequest::ClearQuarantine { .. } if self.fail_post_processing => {
                    Err(ChannelError::Failed("xattr missing".to_string()))
                }
                _ => Ok(()),
            }
        }
    }

    /// Grants elevated access, records every request and carries out swaps
    /// in process.
    struct RecordingChannel {
        inner: InProcessChannel,
        requests: Mutex<Vec<PrivilegedRequest>>,
    }

    impl RecordingChannel {
        fn new(state_dir: PathBuf) -> Arc<Self> {
            Arc::new(Self {
                inner: InProcessChannel::new(state_dir),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<PrivilegedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PrivilegedChannel for RecordingChannel {
        async fn send(&self, request: PrivilegedRequest) -> Result<(), ChannelError> {
            self.requests.lock().unwrap().push(request.clone());
            match request {
                PrivilegedRequest::AcquireElevatedAccess { destination } => {
                    fs::create_dir_all(destination)
                        .map_err(|e| ChannelError::Failed(e.to_string()))
                }
                swap @ PrivilegedRequest::PerformSwap { .. } => self.inner.send(swap).await,
                _ => Ok(()),
            }
        }
    }

    fn states(report: &InstallReport) -> Vec<InstallationState> {
        report.history.iter().map(|t| t.to.clone()).collect()
    }

    #[tokio::test]
    async fn test_full_install() {
        let fx = Fixture::new("TEAM");
        let candidate = fx.candidate("1.2", "TEAM");
        let plan = InstallPlan::new(SelectionDecision::FullInstall { candidate }, &fx.installed);

        let report = fx
            .coordinator(fx.in_process())
            .install(&plan, &CancellationHandle::new())
            .await
            .unwrap();

        assert!(report.is_success(), "{:?}", report.outcome);
        assert!(!report.used_full_fallback);
        assert_eq!(
            states(&report),
            vec![
                InstallationState::Staging,
                InstallationState::AwaitingAuthorization,
                InstallationState::Swapping,
                InstallationState::PostProcessing,
                InstallationState::Done,
            ]
        );
        assert_eq!(fx.installed_content(), "1.2");
        assert!(!fx.installed.with_file_name(".App.previous").exists());
        // Per-attempt staging dir is gone
        assert_eq!(
            fs::read_dir(fx.dir.path().join("state/staging")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn test_untrusted_signature_fails_in_verifying() {
        let fx = Fixture::new("TEAM");
        let mut candidate = fx.candidate("1.2", "TEAM");
        candidate.signatures = SignatureSet::modern(TestSigner::with_seed(9).sign_modern(b"other"));
        let plan = InstallPlan::new(SelectionDecision::FullInstall { candidate }, &fx.installed);

        let report = fx
            .coordinator(fx.in_process())
            .install(&plan, &CancellationHandle::new())
            .await
            .unwrap();

        assert!(matches!(report.failure(), Some(FailureReason::Untrusted(_))));
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.history[0].from, InstallationState::Verifying);
        assert_eq!(fx.installed_content(), "v1.1");
    }

    #[tokio::test]
    async fn test_missing_signature_is_unverifiable() {
        let fx = Fixture::new("TEAM");
        let mut candidate = fx.candidate("1.2", "TEAM");
        candidate.signatures = SignatureSet::default();
        let plan = InstallPlan::new(SelectionDecision::FullInstall { candidate }, &fx.installed);

        let report = fx
            .coordinator(fx.in_process())
            .install(&plan, &CancellationHandle::new())
            .await
            .unwrap();
        assert!(matches!(report.failure(), Some(FailureReason::Unverifiable(_))));
    }

    #[tokio::test]
    async fn test_identity_change_is_untrusted() {
        let fx = Fixture::new("TEAM");
        let candidate = fx.candidate("1.2", "INTRUDER");
        let plan = InstallPlan::new(SelectionDecision::FullInstall { candidate }, &fx.installed);

        let report = fx
            .coordinator(fx.in_process())
            .install(&plan, &CancellationHandle::new())
            .await
            .unwrap();

        assert!(matches!(report.failure(), Some(FailureReason::Untrusted(_))));
        assert!(!states(&report).contains(&InstallationState::AwaitingAuthorization));
        assert_eq!(fx.installed_content(), "v1.1");
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let fx = Fixture::new("TEAM");
        let candidate = fx.candidate("1.2", "TEAM");
        let plan = InstallPlan::new(SelectionDecision::FullInstall { candidate }, &fx.installed);
        let cancel = CancellationHandle::new();
        cancel.cancel().unwrap();

        let report = fx.coordinator(fx.in_process()).install(&plan, &cancel).await.unwrap();
        assert_eq!(report.failure(), Some(&FailureReason::Cancelled));
        assert_eq!(fx.installed_content(), "v1.1");
    }

    #[tokio::test]
    async fn test_cancel_refused_after_swap() {
        let fx = Fixture::new("TEAM");
        let candidate = fx.candidate("1.2", "TEAM");
        let plan = InstallPlan::new(SelectionDecision::FullInstall { candidate }, &fx.installed);
        let cancel = CancellationHandle::new();

        let report = fx.coordinator(fx.in_process()).install(&plan, &cancel).await.unwrap();
        assert!(report.is_success());
        assert!(cancel.cancel().is_err());
    }

    #[tokio::test]
    async fn test_authorization_denied() {
        let fx = Fixture::new("TEAM");
        let candidate = fx.candidate("1.2", "TEAM");
        // Parent does not exist, so the destination is not writable
        let target = fx.dir.path().join("locked/App");
        let plan = InstallPlan::new(SelectionDecision::FullInstall { candidate }, &target);
        let channel = Arc::new(ScriptedChannel {
            access: Some(ChannelError::Denied("user refused".to_string())),
            hang: false,
            fail_post_processing: false,
        });

        let report = fx
            .coordinator(channel)
            .install(&plan, &CancellationHandle::new())
            .await
            .unwrap();
        assert!(matches!(
            report.failure(),
            Some(FailureReason::AuthorizationDenied(_))
        ));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_authorization_timeout() {
        let fx = Fixture::new("TEAM");
        let candidate = fx.candidate("1.2", "TEAM");
        let plan = InstallPlan::new(
            SelectionDecision::FullInstall { candidate },
            fx.dir.path().join("locked/App"),
        );
        let channel = Arc::new(ScriptedChannel {
            access: None,
            hang: true,
            fail_post_processing: false,
        });

        let report = fx
            .coordinator(channel)
            .install(&plan, &CancellationHandle::new())
            .await
            .unwrap();
        assert!(matches!(
            report.failure(),
            Some(FailureReason::AuthorizationTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_authorization() {
        let fx = Fixture::new("TEAM");
        let candidate = fx.candidate("1.2", "TEAM");
        let plan = InstallPlan::new(
            SelectionDecision::FullInstall { candidate },
            fx.dir.path().join("locked/App"),
        );
        let channel = Arc::new(ScriptedChannel {
            access: None,
            hang: true,
            fail_post_processing: false,
        });
        let mut coordinator = fx.coordinator(channel);
        coordinator.settings.authorization_timeout = Duration::from_secs(30);

        let cancel = CancellationHandle::new();
        let remote = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            remote.cancel().unwrap();
        });

        let report = coordinator.install(&plan, &cancel).await.unwrap();
        assert_eq!(report.failure(), Some(&FailureReason::Cancelled));
        assert_eq!(
            report.history.last().unwrap().from,
            InstallationState::AwaitingAuthorization
        );
    }

    #[tokio::test]
    async fn test_post_processing_failures_are_warnings() {
        let fx = Fixture::new("TEAM");
        let candidate = fx.candidate("1.2", "TEAM");
        let plan = InstallPlan::new(SelectionDecision::FullInstall { candidate }, &fx.installed);
        let channel = Arc::new(ScriptedChannel {
            access: None,
            hang: false,
            fail_post_processing: true,
        });

        let report = fx
            .coordinator(channel)
            .install(&plan, &CancellationHandle::new())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("clear_quarantine"));
    }

    #[tokio::test]
    async fn test_busy_and_no_update() {
        let fx = Fixture::new("TEAM");
        let coordinator = fx.coordinator(fx.in_process());

        let result = coordinator
            .install(
                &InstallPlan::new(SelectionDecision::NoUpdate, &fx.installed),
                &CancellationHandle::new(),
            )
            .await;
        assert!(matches!(result, Err(InstallError::NoUpdate)));

        let _held = InstallLocks::new(&fx.dir.path().join("state"))
            .acquire(&fx.installed)
            .unwrap();
        let candidate = fx.candidate("1.2", "TEAM");
        let result = coordinator
            .install(
                &InstallPlan::new(SelectionDecision::FullInstall { candidate }, &fx.installed),
                &CancellationHandle::new(),
            )
            .await;
        assert!(matches!(result, Err(InstallError::Busy(_))));
    }

    #[tokio::test]
    async fn test_elevated_swap_goes_through_channel() {
        let fx = Fixture::new("TEAM");
        let candidate = fx.candidate("1.2", "TEAM");
        // Parent does not exist, so the coordinator has to ask for access
        let target = fx.dir.path().join("locked/App");
        let plan = InstallPlan::new(SelectionDecision::FullInstall { candidate }, &target);
        let channel = RecordingChannel::new(fx.dir.path().join("state"));

        let report = fx
            .coordinator(channel.clone())
            .install(&plan, &CancellationHandle::new())
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.outcome);
        assert_eq!(fs::read_to_string(target.join("bin/app")).unwrap(), "1.2");

        let requests = channel.requests();
        let names: Vec<&str> = requests.iter().map(PrivilegedRequest::name).collect();
        assert_eq!(names[..2], ["acquire_elevated_access", "perform_swap"]);
        match &requests[1] {
            PrivilegedRequest::PerformSwap { staged, installed } => {
                assert_eq!(installed, &target);
                assert!(staged.starts_with(fx.dir.path().join("state/staging")));
            }
            other => panic!("expected perform_swap, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_install_leaves_other_bundles_interrupted_swap_alone() {
        let fx = Fixture::new("TEAM");
        let state_dir = fx.dir.path().join("state");
        let other = write_bundle(
            &fx.dir.path().join("others"),
            "App",
            &BundleInfo::new("com.example.app", "1.1").signed_by("TEAM"),
            &[("bin/app", b"v1.1")],
        )
        .unwrap();

        // First bundle crashed after moving itself aside; its installer
        // still holds the lock.
        let paths = SwapPaths::for_installed(&fx.installed).unwrap();
        fs::rename(&fx.installed, &paths.previous).unwrap();
        write_bundle(
            &fx.dir.path().join("apps"),
            ".App.incoming",
            &BundleInfo::new("com.example.app", "1.2").signed_by("TEAM"),
            &[("bin/app", b"1.2")],
        )
        .unwrap();
        let swapper = BundleSwapper::new(&state_dir);
        let journal_path = swapper.journal_path(&fx.installed);
        fs::create_dir_all(&state_dir).unwrap();
        let journal = SwapJournal {
            paths: paths.clone(),
            phase: SwapPhase::InstalledMoved,
            started_at: Utc::now(),
        };
        fs::write(&journal_path, serde_json::to_string(&journal).unwrap()).unwrap();
        let held = InstallLocks::new(&state_dir).acquire(&fx.installed).unwrap();

        let coordinator = fx.coordinator(fx.in_process());
        let candidate = fx.candidate("1.2", "TEAM");
        let plan = InstallPlan::new(SelectionDecision::FullInstall { candidate }, &other);
        let report = coordinator
            .install(&plan, &CancellationHandle::new())
            .await
            .unwrap();
        assert!(report.is_success(), "{:?}", report.outcome);
        assert_eq!(fs::read_to_string(other.join("bin/app")).unwrap(), "1.2");

        assert!(!fx.installed.exists());
        assert!(paths.previous.exists());
        assert!(paths.incoming.exists());
        assert!(journal_path.exists());

        // Recovery skips a bundle whose lock is held
        assert!(coordinator.recover_all().unwrap().is_empty());
        assert!(journal_path.exists());

        drop(held);
        let reports = coordinator.recover_all().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].bundle, fx.installed);
        assert!(matches!(reports[0].result, Ok(RecoveryAction::Restored(_))));
        assert_eq!(fx.installed_content(), "v1.1");
        assert!(!paths.incoming.exists());
        assert!(!journal_path.exists());
    }
}
