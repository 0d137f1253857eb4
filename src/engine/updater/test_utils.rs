//! Fixtures for tests: signing keys, bundles and archives.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use flate2::write::GzEncoder;
use flate2::Compression;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use walkdir::WalkDir;

use super::identity::BundleInfo;
use super::verify::{IdentityPolicy, TrustRoot, TrustVerifier};

/// Holds one key per signature scheme.
pub struct TestSigner {
    modern: SigningKey,
    legacy: EcdsaKeyPair,
    rng: SystemRandom,
}

impl TestSigner {
    pub fn new() -> Self {
        Self::with_seed(7)
    }

    /// Ed25519 key derived from `seed`; the ECDSA key is always fresh.
    pub fn with_seed(seed: u8) -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .expect("generate ECDSA key");
        let legacy = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng)
            .expect("load ECDSA key");
        Self {
            modern: SigningKey::from_bytes(&[seed; 32]),
            legacy,
            rng,
        }
    }

    /// Base64 Ed25519 signature over the SHA-256 of `bytes`.
    pub fn sign_modern(&self, bytes: &[u8]) -> String {
        let digest = TrustVerifier::sha256(bytes);
        BASE64.encode(self.modern.sign(&digest).to_bytes())
    }

    /// Base64 ECDSA P-256 signature over the SHA-256 of `bytes`.
    pub fn sign_legacy(&self, bytes: &[u8]) -> String {
        let digest = TrustVerifier::sha256(bytes);
        let signature = self.legacy.sign(&self.rng, &digest).expect("ECDSA sign");
        BASE64.encode(signature.as_ref())
    }

    pub fn sign_file_modern(&self, path: &Path) -> io::Result<String> {
        Ok(self.sign_modern(&fs::read(path)?))
    }

    /// `(ed25519, ecdsa)` public keys, base64 encoded.
    pub fn public_keys_base64(&self) -> (String, String) {
        (
            BASE64.encode(self.modern.verifying_key().to_bytes()),
            BASE64.encode(self.legacy.public_key().as_ref()),
        )
    }

    pub fn trust_root(&self) -> TrustRoot {
        TrustRoot::new()
            .with_modern_key(&self.modern.verifying_key().to_bytes())
            .and_then(|root| root.with_legacy_key(self.legacy.public_key().as_ref()))
            .expect("test keys are valid")
    }

    pub fn verifier(&self) -> TrustVerifier {
        TrustVerifier::new(self.trust_root(), IdentityPolicy::default())
    }
}

impl Default for TestSigner {
    fn default() -> Self {
        Self::new()
    }
}

/// Create `parent/name` with a `bundle-info.json` and the given files.
pub fn write_bundle(
    parent: &Path,
    name: &str,
    info: &BundleInfo,
    files: &[(&str, &[u8])],
) -> io::Result<PathBuf> {
    let bundle = parent.join(name);
    fs::create_dir_all(&bundle)?;
    info.write_to(&bundle)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    for (path, content) in files {
        let target = bundle.join(path);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(target, content)?;
    }
    Ok(bundle)
}

/// Pack `bundle` into a `.tar.gz` with the bundle directory at the top.
pub fn pack_tar_gz(bundle: &Path, out: &Path) -> io::Result<()> {
    let name = bundle
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bundle has no name"))?;
    let mut builder = tar::Builder::new(GzEncoder::new(File::create(out)?, Compression::default()));
    builder.append_dir_all(name, bundle)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Pack `bundle` into a `.zip` with the bundle directory at the top.
pub fn pack_zip(bundle: &Path, out: &Path) -> io::Result<()> {
    let parent = bundle.parent().unwrap_or(Path::new(""));
    let mut zip = zip::ZipWriter::new(File::create(out)?);
    let options = zip::write::SimpleFileOptions::default();

    for entry in WalkDir::new(bundle).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(parent)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = relative.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            zip.add_directory(name, options).map_err(zip_error)?;
        } else {
            zip.start_file(name, options).map_err(zip_error)?;
            zip.write_all(&fs::read(entry.path())?)?;
        }
    }
    zip.finish().map_err(zip_error)?;
    Ok(())
}

fn zip_error(err: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}
