//! Candidate Selection
//!
//! Filters the feed against the host snapshot and picks what to install:
//! a delta when an exact-base patch to the best release exists, otherwise the
//! best full release, otherwise nothing.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::FeedInvalid;
use super::feed::{CandidateRecord, DeltaDescriptor, HostState};
use super::rollout::{Clock, RolloutPolicy, StagedIntervalPolicy, SystemClock};
use super::version::{compare_versions, StandardVersionComparator, VersionComparator};

/// Outcome of one selection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SelectionDecision {
    NoUpdate,
    FullInstall {
        candidate: CandidateRecord,
    },
    DeltaInstall {
        candidate: CandidateRecord,
        delta: DeltaDescriptor,
    },
}

impl SelectionDecision {
    pub fn candidate(&self) -> Option<&CandidateRecord> {
        match self {
            Self::NoUpdate => None,
            Self::FullInstall { candidate } | Self::DeltaInstall { candidate, .. } => {
                Some(candidate)
            }
        }
    }

    pub fn delta(&self) -> Option<&DeltaDescriptor> {
        match self {
            Self::DeltaInstall { delta, .. } => Some(delta),
            _ => None,
        }
    }

    pub fn is_update(&self) -> bool {
        !matches!(self, Self::NoUpdate)
    }
}

/// Why a candidate did not survive filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Invalid(FeedInvalid),
    OsTooOld { required: String },
    OsTooNew { maximum: String },
    ChannelNotAllowed(String),
    Skipped,
    NotNewer,
    RolloutLocked { group: u32 },
}

/// Why the delta of a best-version candidate was not used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaRejection {
    MinimumAutoupdateVersion { required: String },
    LargerThanFull { delta: u64, full: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedCandidate {
    /// Position in the feed.
    pub index: usize,
    pub version: String,
    pub reason: Rejection,
}

/// Decision plus the diagnostics that led to it.
#[derive(Debug, Clone)]
pub struct SelectionReport {
    pub decision: SelectionDecision,
    pub rejections: Vec<RejectedCandidate>,
    pub delta_rejections: Vec<(String, DeltaRejection)>,
}

/// Picks the next version to install from an ordered feed.
///
/// The comparator, rollout policy and clock are injected so that selection is
/// a pure function of `(candidates, host, clock)`.
pub struct CandidateSelector {
    comparator: Arc<dyn VersionComparator>,
    rollout_policy: Arc<dyn RolloutPolicy>,
    clock: Arc<dyn Clock>,
}

impl CandidateSelector {
    pub fn new(
        comparator: Arc<dyn VersionComparator>,
        rollout_policy: Arc<dyn RolloutPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            comparator,
            rollout_policy,
            clock,
        }
    }

    /// Selector with the default rollout policy and the system clock.
    pub fn from_comparator(comparator: Arc<dyn VersionComparator>) -> Self {
        Self::new(
            comparator,
            Arc::new(StagedIntervalPolicy::default()),
            Arc::new(SystemClock),
        )
    }

    pub fn with_rollout_policy(mut self, policy: Arc<dyn RolloutPolicy>) -> Self {
        self.rollout_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn comparator(&self) -> &dyn VersionComparator {
        self.comparator.as_ref()
    }

    /// Select the update to install, if any.
    pub fn select(&self, candidates: &[CandidateRecord], host: &HostState) -> SelectionDecision {
        self.evaluate(candidates, host).decision
    }

    /// Select and keep the per-candidate reasons for rejection.
    pub fn evaluate(&self, candidates: &[CandidateRecord], host: &HostState) -> SelectionReport {
        let mut rejections = Vec::new();
        let mut survivors: Vec<&CandidateRecord> = Vec::new();

        for (index, candidate) in candidates.iter().enumerate() {
            match self.filter(candidate, host) {
                Ok(()) => survivors.push(candidate),
                Err(reason) => {
                    match &reason {
                        Rejection::Invalid(err) => {
                            warn!("Skipping malformed feed entry #{}: {}", index, err)
                        }
                        other => debug!(
                            "Candidate {} rejected: {:?}",
                            candidate.version, other
                        ),
                    }
                    rejections.push(RejectedCandidate {
                        index,
                        version: candidate.version.clone(),
                        reason,
                    });
                }
            }
        }

        let Some(best) = self.best_full(&survivors) else {
            debug!("No eligible update for host version {}", host.current_version);
            return SelectionReport {
                decision: SelectionDecision::NoUpdate,
                rejections,
                delta_rejections: Vec::new(),
            };
        };

        let mut delta_rejections = Vec::new();
        let decision = match self.best_delta(&survivors, best, host, &mut delta_rejections) {
            Some((candidate, delta)) => {
                info!(
                    "Selected delta update {} -> {}",
                    delta.base_version, candidate.version
                );
                SelectionDecision::DeltaInstall {
                    candidate: candidate.clone(),
                    delta: delta.clone(),
                }
            }
            None => {
                info!("Selected full update to {}", best.version);
                SelectionDecision::FullInstall {
                    candidate: best.clone(),
                }
            }
        };

        SelectionReport {
            decision,
            rejections,
            delta_rejections,
        }
    }

    fn filter(&self, candidate: &CandidateRecord, host: &HostState) -> Result<(), Rejection> {
        candidate.validate().map_err(Rejection::Invalid)?;

        // OS versions always use the standard ordering.
        if host.test_os_version {
            if let Some(required) = &candidate.minimum_os_version {
                if compare_versions(required, &host.os_version) == Ordering::Greater {
                    return Err(Rejection::OsTooOld {
                        required: required.clone(),
                    });
                }
            }
            if let Some(maximum) = &candidate.maximum_os_version {
                if compare_versions(maximum, &host.os_version) == Ordering::Less {
                    return Err(Rejection::OsTooNew {
                        maximum: maximum.clone(),
                    });
                }
            }
        }

        if !host.allows_channel(candidate.channel.as_deref()) {
            return Err(Rejection::ChannelNotAllowed(
                candidate.channel.clone().unwrap_or_default(),
            ));
        }

        // Token equality: no comparator can bring a skipped release back.
        if host.skipped_version.as_deref() == Some(candidate.version.as_str()) {
            return Err(Rejection::Skipped);
        }

        if self.comparator.compare(&candidate.version, &host.current_version) != Ordering::Greater
        {
            return Err(Rejection::NotNewer);
        }

        if let (Some(rollout), Some(group)) = (&candidate.rollout, host.rollout_group) {
            if !candidate.critical
                && !self.rollout_policy.is_unlocked(
                    group,
                    rollout,
                    candidate.published_at,
                    self.clock.now(),
                )
            {
                return Err(Rejection::RolloutLocked { group });
            }
        }

        Ok(())
    }

    /// Maximum by comparator; on ties the first one in feed order wins.
    fn best_full<'a>(&self, survivors: &[&'a CandidateRecord]) -> Option<&'a CandidateRecord> {
        let mut best: Option<&'a CandidateRecord> = None;
        for &candidate in survivors {
            best = match best {
                Some(current)
                    if self.comparator.compare(&candidate.version, &current.version)
                        != Ordering::Greater =>
                {
                    Some(current)
                }
                _ => Some(candidate),
            };
        }
        best
    }

    fn best_delta<'a>(
        &self,
        survivors: &[&'a CandidateRecord],
        best: &CandidateRecord,
        host: &HostState,
        notes: &mut Vec<(String, DeltaRejection)>,
    ) -> Option<(&'a CandidateRecord, &'a DeltaDescriptor)> {
        for &candidate in survivors {
            if self.comparator.compare(&candidate.version, &best.version) != Ordering::Equal {
                continue;
            }
            let Some(delta) = candidate.delta_from(&host.current_version) else {
                continue;
            };

            if host.test_minimum_autoupdate_version {
                if let Some(required) = &candidate.minimum_autoupdate_version {
                    if self.comparator.compare(&host.current_version, required) == Ordering::Less {
                        notes.push((
                            candidate.version.clone(),
                            DeltaRejection::MinimumAutoupdateVersion {
                                required: required.clone(),
                            },
                        ));
                        continue;
                    }
                }
            }

            if delta.artifact.length > candidate.artifact.length {
                debug!(
                    "Ignoring delta for {}: {} bytes exceeds full artifact of {} bytes",
                    candidate.version, delta.artifact.length, candidate.artifact.length
                );
                notes.push((
                    candidate.version.clone(),
                    DeltaRejection::LargerThanFull {
                        delta: delta.artifact.length,
                        full: candidate.artifact.length,
                    },
                ));
                continue;
            }

            return Some((candidate, delta));
        }
        None
    }
}

impl Default for CandidateSelector {
    fn default() -> Self {
        Self::from_comparator(Arc::new(StandardVersionComparator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::feed::{ArtifactDescriptor, PhasedRollout, SignatureSet};
    use crate::engine::updater::rollout::FixedClock;
    use chrono::{Duration, TimeZone, Utc};

    fn full(version: &str) -> CandidateRecord {
        CandidateRecord::new(
            version,
            ArtifactDescriptor::new(format!("https://example.com/App-{version}.tar.gz"), 1000),
        )
    }

    fn delta(base: &str, length: u64) -> DeltaDescriptor {
        DeltaDescriptor {
            base_version: base.to_string(),
            artifact: ArtifactDescriptor::new(format!("https://example.com/{base}.delta"), length),
            signatures: SignatureSet::default(),
        }
    }

    fn host(version: &str) -> HostState {
        HostState::new(version, "14.2")
    }

    fn version_of(decision: &SelectionDecision) -> Option<&str> {
        decision.candidate().map(|c| c.version.as_str())
    }

    #[test]
    fn test_newest_full_wins_over_delta_to_older_target() {
        let feed = vec![full("1.1").with_delta(delta("1.0", 100)), full("1.2")];
        let decision = CandidateSelector::default().select(&feed, &host("1.0"));
        assert!(matches!(decision, SelectionDecision::FullInstall { .. }));
        assert_eq!(version_of(&decision), Some("1.2"));
    }

    #[test]
    fn test_delta_selected_when_base_matches() {
        let feed = vec![full("1.1").with_delta(delta("1.0", 100))];
        let decision = CandidateSelector::default().select(&feed, &host("1.0"));
        match decision {
            SelectionDecision::DeltaInstall { candidate, delta } => {
                assert_eq!(candidate.version, "1.1");
                assert_eq!(delta.base_version, "1.0");
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn test_delta_base_mismatch_falls_back_to_full() {
        let feed = vec![full("1.2").with_delta(delta("1.1", 100))];
        let decision = CandidateSelector::default().select(&feed, &host("1.0"));
        assert!(matches!(decision, SelectionDecision::FullInstall { .. }));
        assert_eq!(version_of(&decision), Some("1.2"));
    }

    #[test]
    fn test_multiple_deltas_key_on_exact_base() {
        let feed = vec![full("1.3")
            .with_delta(delta("1.1", 100))
            .with_delta(delta("1.2", 100))];
        let decision = CandidateSelector::default().select(&feed, &host("1.2"));
        assert_eq!(decision.delta().map(|d| d.base_version.as_str()), Some("1.2"));

        // Base lookup is by string, not by comparator.
        let decision = CandidateSelector::default().select(&feed, &host("1.2.0"));
        assert!(matches!(decision, SelectionDecision::FullInstall { .. }));
    }

    #[test]
    fn test_oversized_delta_rejected() {
        let feed = vec![full("1.1").with_delta(delta("1.0", 5000))];
        let report = CandidateSelector::default().evaluate(&feed, &host("1.0"));
        assert!(matches!(report.decision, SelectionDecision::FullInstall { .. }));
        assert!(matches!(
            report.delta_rejections[0].1,
            DeltaRejection::LargerThanFull { delta: 5000, full: 1000 }
        ));
    }

    #[test]
    fn test_minimum_autoupdate_version_blocks_delta() {
        let mut rec = full("2.0").with_delta(delta("1.0", 100));
        rec.minimum_autoupdate_version = Some("1.5".to_string());
        let feed = vec![rec];

        let decision = CandidateSelector::default().select(&feed, &host("1.0"));
        assert!(matches!(decision, SelectionDecision::FullInstall { .. }));

        let mut relaxed = host("1.0");
        relaxed.test_minimum_autoupdate_version = false;
        let decision = CandidateSelector::default().select(&feed, &relaxed);
        assert!(matches!(decision, SelectionDecision::DeltaInstall { .. }));
    }

    #[test]
    fn test_no_update_when_nothing_newer() {
        let feed = vec![full("0.9"), full("1.0")];
        let decision = CandidateSelector::default().select(&feed, &host("1.0"));
        assert_eq!(decision, SelectionDecision::NoUpdate);
        assert_eq!(
            CandidateSelector::default().select(&[], &host("1.0")),
            SelectionDecision::NoUpdate
        );
    }

    #[test]
    fn test_skipped_version_never_selected_under_any_comparator() {
        let feed = vec![full("1.1"), full("1.5"), full("1.3")];
        let mut state = host("1.0");
        state.skipped_version = Some("1.5".to_string());

        let standard = CandidateSelector::default();
        assert_eq!(version_of(&standard.select(&feed, &state)), Some("1.3"));

        // Everything is newer than everything else.
        let chaotic =
            CandidateSelector::from_comparator(Arc::new(|_: &str, _: &str| Ordering::Greater));
        assert_ne!(version_of(&chaotic.select(&feed, &state)), Some("1.5"));

        // Reverse ordering.
        let reversed = CandidateSelector::from_comparator(Arc::new(|a: &str, b: &str| {
            crate::engine::updater::version::compare_versions(b, a)
        }));
        let mut old_host = host("9.9");
        old_host.skipped_version = Some("1.1".to_string());
        assert_eq!(version_of(&reversed.select(&feed, &old_host)), Some("1.3"));
    }

    #[test]
    fn test_tie_first_seen_wins() {
        let mut first = full("1.1");
        first.artifact.url = "https://example.com/first.tar.gz".to_string();
        let mut second = full("1.1.0");
        second.artifact.url = "https://example.com/second.tar.gz".to_string();

        let first_char = CandidateSelector::from_comparator(Arc::new(|a: &str, b: &str| {
            a.chars().next().cmp(&b.chars().next())
        }));
        let decision = first_char.select(&[first, second], &host("0.5"));
        assert_eq!(
            decision.candidate().map(|c| c.artifact.url.as_str()),
            Some("https://example.com/first.tar.gz")
        );
    }

    #[test]
    fn test_os_requirements() {
        let mut too_new = full("1.2");
        too_new.minimum_os_version = Some("15.0".to_string());
        let mut retired = full("1.3");
        retired.maximum_os_version = Some("13.9".to_string());
        let feed = vec![full("1.1"), too_new, retired];

        let decision = CandidateSelector::default().select(&feed, &host("1.0"));
        assert_eq!(version_of(&decision), Some("1.1"));

        let mut untested = host("1.0");
        untested.test_os_version = false;
        let decision = CandidateSelector::default().select(&feed, &untested);
        assert_eq!(version_of(&decision), Some("1.3"));
    }

    #[test]
    fn test_invalid_records_are_skipped_not_fatal() {
        let mut broken = full("3.0");
        broken.artifact.url.clear();
        let feed = vec![broken, full("1.1")];

        let report = CandidateSelector::default().evaluate(&feed, &host("1.0"));
        assert_eq!(version_of(&report.decision), Some("1.1"));
        assert!(matches!(
            report.rejections[0].reason,
            Rejection::Invalid(FeedInvalid::MissingArtifactUrl { .. })
        ));
    }

    #[test]
    fn test_channels_filter() {
        let mut beta = full("2.0");
        beta.channel = Some("beta".to_string());
        let feed = vec![full("1.1"), beta];

        let decision = CandidateSelector::default().select(&feed, &host("1.0"));
        assert_eq!(version_of(&decision), Some("1.1"));

        let mut beta_host = host("1.0");
        beta_host.allowed_channels = vec!["beta".to_string()];
        let decision = CandidateSelector::default().select(&feed, &beta_host);
        assert_eq!(version_of(&decision), Some("2.0"));
    }

    #[test]
    fn test_rollout_gate_is_deterministic_and_falls_back() {
        let published = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let staged = full("1.2")
            .with_rollout(PhasedRollout::Interval { interval_secs: 86_400 }, published);
        let feed = vec![full("1.1"), staged];

        let selector = CandidateSelector::default()
            .with_clock(Arc::new(FixedClock(published + Duration::hours(30))));

        let mut early = host("1.0");
        early.rollout_group = Some(1);
        let mut late = host("1.0");
        late.rollout_group = Some(5);

        for _ in 0..3 {
            assert_eq!(version_of(&selector.select(&feed, &early)), Some("1.2"));
            assert_eq!(version_of(&selector.select(&feed, &late)), Some("1.1"));
        }

        // No group assigned: gate is not applied.
        assert_eq!(version_of(&selector.select(&feed, &host("1.0"))), Some("1.2"));
    }

    #[test]
    fn test_critical_update_bypasses_rollout() {
        let published = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let mut critical =
            full("1.2").with_rollout(PhasedRollout::Percentage { percent: 0 }, published);
        critical.critical = true;

        let selector = CandidateSelector::default().with_clock(Arc::new(FixedClock(published)));
        let mut state = host("1.0");
        state.rollout_group = Some(3);
        assert_eq!(version_of(&selector.select(&[critical], &state)), Some("1.2"));
    }

    #[test]
    fn test_never_both_full_and_delta() {
        let feeds = vec![
            vec![full("1.1").with_delta(delta("1.0", 10))],
            vec![full("1.1").with_delta(delta("1.0", 10)), full("1.2")],
            vec![full("1.2").with_delta(delta("0.9", 10))],
        ];
        for feed in feeds {
            match CandidateSelector::default().select(&feed, &host("1.0")) {
                SelectionDecision::DeltaInstall { candidate, delta } => {
                    assert_eq!(delta.base_version, "1.0");
                    assert!(candidate.deltas.contains(&delta));
                }
                SelectionDecision::FullInstall { candidate } => {
                    assert!(candidate.delta_from("1.0").is_none())
                }
                SelectionDecision::NoUpdate => panic!("expected an update"),
            }
        }
    }
}
