//! Feed Data Model
//!
//! Candidate records as produced by the external feed parser, and the host
//! snapshot they are evaluated against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::FeedInvalid;

/// Where an artifact lives and how big it is supposed to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub url: String,
    pub length: u64,
    /// Optional hex SHA-256 published alongside the signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ArtifactDescriptor {
    pub fn new(url: impl Into<String>, length: u64) -> Self {
        Self {
            url: url.into(),
            length,
            sha256: None,
        }
    }

    /// File name component of the URL, used when storing downloads.
    pub fn file_name(&self) -> Option<&str> {
        let path = self.url.split(|c| c == '?' || c == '#').next()?;
        path.rsplit('/').next().filter(|name| !name.is_empty())
    }
}

/// Base64 signature payloads attached to a downloadable artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSet {
    /// Ed25519 signature over the artifact's SHA-256 digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modern: Option<String>,
    /// ECDSA P-256 signature over the artifact's SHA-256 digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy: Option<String>,
}

/// A signature tagged with the scheme that must verify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSignature {
    Legacy(LegacySignature),
    Modern(ModernSignature),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacySignature {
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModernSignature {
    pub payload: String,
}

impl SignatureSet {
    pub fn modern(payload: impl Into<String>) -> Self {
        Self {
            modern: Some(payload.into()),
            legacy: None,
        }
    }

    pub fn legacy(payload: impl Into<String>) -> Self {
        Self {
            modern: None,
            legacy: Some(payload.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modern.is_none() && self.legacy.is_none()
    }

    /// The signature verification must use: modern whenever one is supplied,
    /// legacy only in its absence.
    pub fn preferred(&self) -> Option<ArtifactSignature> {
        if let Some(payload) = &self.modern {
            return Some(ArtifactSignature::Modern(ModernSignature {
                payload: payload.clone(),
            }));
        }
        self.legacy.as_ref().map(|payload| {
            ArtifactSignature::Legacy(LegacySignature {
                payload: payload.clone(),
            })
        })
    }
}

/// An incremental patch from one exact base version to the record's version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaDescriptor {
    pub base_version: String,
    pub artifact: ArtifactDescriptor,
    #[serde(default)]
    pub signatures: SignatureSet,
}

/// Gradual exposure of a release across rollout groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhasedRollout {
    /// One more group unlocks every `interval_secs` after publication.
    Interval { interval_secs: u64 },
    /// A fixed share of groups is unlocked.
    Percentage { percent: u8 },
}

/// One release entry of the update feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_autoupdate_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub artifact: ArtifactDescriptor,
    #[serde(default)]
    pub signatures: SignatureSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deltas: Vec<DeltaDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<PhasedRollout>,
}

impl CandidateRecord {
    /// Minimal record with a full artifact only.
    pub fn new(version: impl Into<String>, artifact: ArtifactDescriptor) -> Self {
        Self {
            version: version.into(),
            display_version: None,
            minimum_os_version: None,
            maximum_os_version: None,
            minimum_autoupdate_version: None,
            channel: None,
            critical: false,
            published_at: None,
            artifact,
            signatures: SignatureSet::default(),
            deltas: Vec::new(),
            rollout: None,
        }
    }

    pub fn with_signatures(mut self, signatures: SignatureSet) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn with_delta(mut self, delta: DeltaDescriptor) -> Self {
        self.deltas.push(delta);
        self
    }

    pub fn with_rollout(mut self, rollout: PhasedRollout, published_at: DateTime<Utc>) -> Self {
        self.rollout = Some(rollout);
        self.published_at = Some(published_at);
        self
    }

    /// Delta whose base is exactly `base_version`, if the record carries one.
    pub fn delta_from(&self, base_version: &str) -> Option<&DeltaDescriptor> {
        self.deltas.iter().find(|d| d.base_version == base_version)
    }

    /// Structural checks. A record failing these is skipped by the selector.
    pub fn validate(&self) -> Result<(), FeedInvalid> {
        if self.version.trim().is_empty() {
            return Err(FeedInvalid::MissingVersion);
        }
        if self.artifact.url.trim().is_empty() {
            return Err(FeedInvalid::MissingArtifactUrl {
                version: self.version.clone(),
            });
        }
        if self.artifact.length == 0 {
            return Err(FeedInvalid::ZeroLength {
                version: self.version.clone(),
            });
        }
        if let Some(PhasedRollout::Percentage { percent }) = self.rollout {
            if percent > 100 {
                return Err(FeedInvalid::RolloutOutOfRange {
                    version: self.version.clone(),
                    percent,
                });
            }
        }
        for delta in &self.deltas {
            if delta.base_version.trim().is_empty() || delta.artifact.url.trim().is_empty() {
                return Err(FeedInvalid::MalformedDelta {
                    version: self.version.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Snapshot of the installed application's update-relevant state.
///
/// Loaded once per check and never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    pub current_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_version: Option<String>,
    /// Persisted rollout group. `None` disables the rollout gate, e.g. for
    /// checks the user started explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_group: Option<u32>,
    pub os_version: String,
    #[serde(default = "default_true")]
    pub test_os_version: bool,
    #[serde(default = "default_true")]
    pub test_minimum_autoupdate_version: bool,
    /// Non-default channels this install follows.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_channels: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl HostState {
    pub fn new(current_version: impl Into<String>, os_version: impl Into<String>) -> Self {
        Self {
            current_version: current_version.into(),
            skipped_version: None,
            rollout_group: None,
            os_version: os_version.into(),
            test_os_version: true,
            test_minimum_autoupdate_version: true,
            allowed_channels: Vec::new(),
        }
    }

    pub fn allows_channel(&self, channel: Option<&str>) -> bool {
        match channel {
            None => true,
            Some(name) => self.allowed_channels.iter().any(|c| c == name),
        }
    }
}
