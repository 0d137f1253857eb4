//! Phased Rollout
//!
//! Decides whether an install's persisted rollout group may see a release yet.
//! The unlock formula is a policy object so it can be replaced without
//! touching the selector.

use chrono::{DateTime, Utc};

use super::feed::PhasedRollout;

/// Number of rollout groups an install can be assigned to.
pub const ROLLOUT_GROUP_COUNT: u32 = 7;

/// Source of "now" for time-based gating.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at a given instant, for deterministic selection.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Pluggable unlock rule.
pub trait RolloutPolicy: Send + Sync {
    fn is_unlocked(
        &self,
        group: u32,
        rollout: &PhasedRollout,
        published_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool;
}

/// Default policy.
///
/// - `Interval`: group `g` unlocks once `g * interval` has elapsed since
///   publication. Group 0 is always unlocked; a release without a
///   publication date is unlocked for everyone.
/// - `Percentage`: the first `ceil(percent * groups / 100)` groups are
///   unlocked.
#[derive(Debug, Clone, Copy)]
pub struct StagedIntervalPolicy {
    groups: u32,
}

impl StagedIntervalPolicy {
    pub fn new(groups: u32) -> Self {
        Self {
            groups: groups.max(1),
        }
    }

    pub fn groups(&self) -> u32 {
        self.groups
    }

    fn unlocked_by_interval(
        &self,
        group: u32,
        interval_secs: u64,
        published_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(published_at) = published_at else {
            return true;
        };
        let elapsed = now.signed_duration_since(published_at).num_seconds().max(0) as u64;
        let required = interval_secs.saturating_mul(u64::from(group));
        elapsed >= required
    }

    fn unlocked_by_percentage(&self, group: u32, percent: u8) -> bool {
        let percent = u32::from(percent.min(100));
        let unlocked_groups = (percent * self.groups + 99) / 100;
        group < unlocked_groups
    }
}

impl Default for StagedIntervalPolicy {
    fn default() -> Self {
        Self::new(ROLLOUT_GROUP_COUNT)
    }
}

impl RolloutPolicy for StagedIntervalPolicy {
    fn is_unlocked(
        &self,
        group: u32,
        rollout: &PhasedRollout,
        published_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let group = group % self.groups;
        match *rollout {
            PhasedRollout::Interval { interval_secs } => {
                self.unlocked_by_interval(group, interval_secs, published_at, now)
            }
            PhasedRollout::Percentage { percent } => self.unlocked_by_percentage(group, percent),
        }
    }
}
