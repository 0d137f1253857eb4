//! Cryptographic Verification
//!
//! Decides whether a downloaded artifact may be installed: the content
//! digest must carry a valid signature from a key pinned in the running
//! application, and the new bundle must continue the installed bundle's
//! signing identity.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::error::FailureReason;
use super::feed::{ArtifactDescriptor, ArtifactSignature, SignatureSet};
use super::identity::{BundleInfo, SigningIdentity};

/// Result of a trust decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum TrustVerdict {
    Trusted,
    /// Evidence was present and it is wrong.
    Untrusted(String),
    /// There was nothing to check against.
    Unverifiable(String),
}

impl TrustVerdict {
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Trusted)
    }

    /// The failure an installation attempt ends with, or `None` if trusted.
    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            Self::Trusted => None,
            Self::Untrusted(reason) => Some(FailureReason::Untrusted(reason.clone())),
            Self::Unverifiable(reason) => Some(FailureReason::Unverifiable(reason.clone())),
        }
    }

    /// Keep `self` unless it is `Trusted`, in which case evaluate `next`.
    fn and_then(self, next: impl FnOnce() -> TrustVerdict) -> TrustVerdict {
        match self {
            Self::Trusted => next(),
            other => other,
        }
    }
}

/// Errors decoding pinned keys.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid Ed25519 public key: {0}")]
    InvalidModernKey(String),

    #[error("Invalid ECDSA P-256 public key: {0}")]
    InvalidLegacyKey(String),
}

/// Public keys bundled with the running application.
///
/// Never sourced from the feed.
#[derive(Debug, Clone, Default)]
pub struct TrustRoot {
    modern: Option<VerifyingKey>,
    /// Uncompressed SEC1 point (65 bytes, leading 0x04).
    legacy: Option<Vec<u8>>,
}

impl TrustRoot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_modern_key(mut self, key_bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let key = VerifyingKey::from_bytes(key_bytes)
            .map_err(|e| KeyError::InvalidModernKey(e.to_string()))?;
        self.modern = Some(key);
        Ok(self)
    }

    pub fn with_legacy_key(mut self, point: &[u8]) -> Result<Self, KeyError> {
        if point.len() != 65 || point[0] != 0x04 {
            return Err(KeyError::InvalidLegacyKey(format!(
                "expected 65-byte uncompressed point, got {} bytes",
                point.len()
            )));
        }
        self.legacy = Some(point.to_vec());
        Ok(self)
    }

    /// Build from base64-encoded keys as stored in the bundled config.
    pub fn from_base64(modern: Option<&str>, legacy: Option<&str>) -> Result<Self, KeyError> {
        let mut root = Self::new();
        if let Some(encoded) = modern {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| KeyError::InvalidModernKey(e.to_string()))?;
            let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                KeyError::InvalidModernKey(format!("expected 32 bytes, got {}", bytes.len()))
            })?;
            root = root.with_modern_key(&bytes)?;
        }
        if let Some(encoded) = legacy {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| KeyError::InvalidLegacyKey(e.to_string()))?;
            root = root.with_legacy_key(&bytes)?;
        }
        Ok(root)
    }

    pub fn has_modern_key(&self) -> bool {
        self.modern.is_some()
    }

    pub fn has_legacy_key(&self) -> bool {
        self.legacy.is_some()
    }
}

/// Signing identities the installed bundle may hand over to.
#[derive(Debug, Clone, Default)]
pub struct IdentityPolicy {
    pub allowed_successors: Vec<SigningIdentity>,
}

impl IdentityPolicy {
    pub fn allows(&self, identity: &SigningIdentity) -> bool {
        self.allowed_successors.contains(identity)
    }
}

/// Verifier for update artifacts and bundle identities.
#[derive(Debug, Clone, Default)]
pub struct TrustVerifier {
    root: TrustRoot,
    policy: IdentityPolicy,
}

impl TrustVerifier {
    pub fn new(root: TrustRoot, policy: IdentityPolicy) -> Self {
        Self { root, policy }
    }

    /// SHA-256 of a byte slice.
    pub fn sha256(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    /// Streaming SHA-256 of a file.
    pub fn sha256_file(path: &Path) -> io::Result<[u8; 32]> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();

        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize().into())
    }

    /// Check a signature against a content digest.
    pub fn verify_signature(
        &self,
        signature: &ArtifactSignature,
        digest: &[u8; 32],
    ) -> TrustVerdict {
        match signature {
            ArtifactSignature::Modern(sig) => {
                let Some(key) = &self.root.modern else {
                    return TrustVerdict::Unverifiable(
                        "no pinned Ed25519 key for modern signature".to_string(),
                    );
                };
                let bytes = match decode_signature(&sig.payload) {
                    Ok(bytes) => bytes,
                    Err(verdict) => return verdict,
                };
                let Ok(sig_array) = <[u8; 64]>::try_from(bytes.as_slice()) else {
                    return TrustVerdict::Untrusted(format!(
                        "Ed25519 signature must be 64 bytes, got {}",
                        bytes.len()
                    ));
                };
                let signature = Signature::from_bytes(&sig_array);
                match key.verify(digest, &signature) {
                    Ok(()) => TrustVerdict::Trusted,
                    Err(_) => TrustVerdict::Untrusted("Ed25519 signature mismatch".to_string()),
                }
            }
            ArtifactSignature::Legacy(sig) => {
                let Some(key) = &self.root.legacy else {
                    return TrustVerdict::Unverifiable(
                        "no pinned ECDSA key for legacy signature".to_string(),
                    );
                };
                let bytes = match decode_signature(&sig.payload) {
                    Ok(bytes) => bytes,
                    Err(verdict) => return verdict,
                };
                let public_key = UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, key.as_slice());
                match public_key.verify(digest, &bytes) {
                    Ok(()) => TrustVerdict::Trusted,
                    Err(_) => TrustVerdict::Untrusted("ECDSA signature mismatch".to_string()),
                }
            }
        }
    }

    /// Verify a signature set against a digest. A modern signature, when
    /// present, is the only one consulted.
    pub fn verify_digest(&self, digest: &[u8; 32], signatures: &SignatureSet) -> TrustVerdict {
        let Some(signature) = signatures.preferred() else {
            return TrustVerdict::Unverifiable("artifact carries no signature".to_string());
        };
        let verdict = self.verify_signature(&signature, digest);
        match &verdict {
            TrustVerdict::Trusted => debug!("Signature verified ({})", scheme_name(&signature)),
            TrustVerdict::Untrusted(reason) | TrustVerdict::Unverifiable(reason) => {
                warn!("Signature rejected ({}): {}", scheme_name(&signature), reason)
            }
        }
        verdict
    }

    pub fn verify_artifact(&self, bytes: &[u8], signatures: &SignatureSet) -> TrustVerdict {
        self.verify_digest(&Self::sha256(bytes), signatures)
    }

    pub fn verify_artifact_file(
        &self,
        path: &Path,
        signatures: &SignatureSet,
    ) -> io::Result<TrustVerdict> {
        let digest = Self::sha256_file(path)?;
        Ok(self.verify_digest(&digest, signatures))
    }

    /// Verify a downloaded file against its descriptor: declared length and
    /// hash (when published) and then the signature.
    pub fn verify_download(
        &self,
        path: &Path,
        descriptor: &ArtifactDescriptor,
        signatures: &SignatureSet,
    ) -> io::Result<TrustVerdict> {
        let length = std::fs::metadata(path)?.len();
        let digest = Self::sha256_file(path)?;
        Ok(check_declared(&digest, length, descriptor)
            .and_then(|| self.verify_digest(&digest, signatures)))
    }

    /// Check that `candidate` continues the identity of the installed bundle.
    pub fn verify_continuity(
        &self,
        previous: Option<&BundleInfo>,
        candidate: &BundleInfo,
    ) -> TrustVerdict {
        let Some(previous) = previous else {
            return TrustVerdict::Trusted;
        };

        if previous.identifier != candidate.identifier {
            return TrustVerdict::Untrusted(format!(
                "bundle identifier changed from {} to {}",
                previous.identifier, candidate.identifier
            ));
        }

        let Some(expected) = &previous.signing_identity else {
            return TrustVerdict::Trusted;
        };
        let Some(actual) = &candidate.signing_identity else {
            return TrustVerdict::Untrusted(format!(
                "update is unsigned but installed bundle is signed by {}",
                expected
            ));
        };

        if actual == expected || self.policy.allows(actual) {
            TrustVerdict::Trusted
        } else {
            warn!("Signing identity {} is not a successor of {}", actual, expected);
            TrustVerdict::Untrusted(format!(
                "signing identity {} does not match {}",
                actual, expected
            ))
        }
    }

    /// Signature and identity checks together; any non-trusted part wins.
    pub fn verify(
        &self,
        bytes: &[u8],
        signatures: &SignatureSet,
        previous: Option<&BundleInfo>,
        candidate: &BundleInfo,
    ) -> TrustVerdict {
        self.verify_artifact(bytes, signatures)
            .and_then(|| self.verify_continuity(previous, candidate))
    }
}

fn decode_signature(payload: &str) -> Result<Vec<u8>, TrustVerdict> {
    BASE64
        .decode(payload.trim())
        .map_err(|e| TrustVerdict::Untrusted(format!("malformed signature encoding: {}", e)))
}

fn scheme_name(signature: &ArtifactSignature) -> &'static str {
    match signature {
        ArtifactSignature::Modern(_) => "ed25519",
        ArtifactSignature::Legacy(_) => "ecdsa-p256",
    }
}

fn check_declared(digest: &[u8; 32], length: u64, descriptor: &ArtifactDescriptor) -> TrustVerdict {
    if length != descriptor.length {
        return TrustVerdict::Untrusted(format!(
            "length mismatch: expected {}, got {}",
            descriptor.length, length
        ));
    }
    if let Some(expected) = &descriptor.sha256 {
        let actual = hex::encode(digest);
        if actual != expected.trim().to_lowercase() {
            return TrustVerdict::Untrusted(format!(
                "checksum mismatch: expected {}, got {}",
                expected, actual
            ));
        }
    }
    TrustVerdict::Trusted
}
