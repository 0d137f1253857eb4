//! Bundle Identity
//!
//! Reads who signed a bundle and what it claims to be, so an update can be
//! checked against the installed application.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::IdentityError;

/// Metadata file at the root of every bundle.
pub const BUNDLE_INFO_FILE: &str = "bundle-info.json";

/// Code-signing identity of a bundle (team / certificate subject).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigningIdentity(pub String);

impl SigningIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity information extracted from a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
    /// Reverse-DNS bundle identifier, e.g. `com.example.app`.
    pub identifier: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_identity: Option<SigningIdentity>,
}

impl BundleInfo {
    pub fn new(identifier: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            version: version.into(),
            signing_identity: None,
        }
    }

    pub fn signed_by(mut self, identity: impl Into<String>) -> Self {
        self.signing_identity = Some(SigningIdentity::new(identity));
        self
    }

    /// Write `bundle-info.json` into `bundle`.
    pub fn write_to(&self, bundle: &Path) -> Result<(), IdentityError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(bundle.join(BUNDLE_INFO_FILE), content)?;
        Ok(())
    }
}

/// Extracts a bundle's identity.
pub trait IdentityInspector: Send + Sync {
    fn inspect(&self, bundle: &Path) -> Result<BundleInfo, IdentityError>;
}

/// Reads `bundle-info.json` at the bundle root.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestInspector;

impl IdentityInspector for ManifestInspector {
    fn inspect(&self, bundle: &Path) -> Result<BundleInfo, IdentityError> {
        let content = fs::read_to_string(bundle.join(BUNDLE_INFO_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }
}
