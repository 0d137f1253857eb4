//! Delta container format.
//!
//! A patch is a gzip-compressed tar stream. The first entry is `delta.json`
//! (a [`DeltaManifest`]); payload blobs follow as `payload/<n>`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::error::Category;

use super::tree::link_escapes;
use crate::engine::updater::error::PatchError;

pub const PATCH_FORMAT_VERSION: u32 = 1;
pub const MANIFEST_ENTRY: &str = "delta.json";
pub const PAYLOAD_PREFIX: &str = "payload/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One per-path step of a patch. Digests are lowercase hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOperation {
    Add {
        path: String,
        kind: EntryKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        digest: Option<String>,
    },
    Delete {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        digest: Option<String>,
    },
    /// Binary diff (bsdiff) of an existing file.
    Modify {
        path: String,
        base_digest: String,
        payload: String,
        digest: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
    SetMode {
        path: String,
        mode: u32,
    },
}

impl DeltaOperation {
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. }
            | Self::Delete { path, .. }
            | Self::Modify { path, .. }
            | Self::SetMode { path, .. } => path,
        }
    }

    pub fn payload(&self) -> Option<&str> {
        match self {
            Self::Add { payload, .. } => payload.as_deref(),
            Self::Modify { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaManifest {
    pub format_version: u32,
    pub base_version: String,
    pub target_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_tree_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tree_digest: Option<String>,
    pub operations: Vec<DeltaOperation>,
}

/// A fully read patch container.
#[derive(Debug, Clone)]
pub struct PatchArchive {
    pub manifest: DeltaManifest,
    payloads: HashMap<String, Vec<u8>>,
}

impl PatchArchive {
    /// Read and structurally validate a patch file. Nothing on disk besides
    /// the patch itself is touched.
    pub fn read(path: &Path) -> Result<Self, PatchError> {
        let file = File::open(path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut entries = archive.entries().map_err(corrupt)?;

        let mut first = match entries.next() {
            Some(entry) => entry.map_err(corrupt)?,
            None => return Err(PatchError::Corrupt("empty patch container".to_string())),
        };
        let first_name = entry_name(&first)?;
        if first_name != MANIFEST_ENTRY {
            return Err(PatchError::Unsupported(format!(
                "first entry must be {}, found {}",
                MANIFEST_ENTRY, first_name
            )));
        }
        let mut raw = Vec::new();
        first.read_to_end(&mut raw).map_err(corrupt)?;
        let manifest = parse_manifest(&raw)?;

        let mut payloads = HashMap::new();
        for entry in entries {
            let mut entry = entry.map_err(corrupt)?;
            let name = entry_name(&entry)?;
            let Some(id) = name.strip_prefix(PAYLOAD_PREFIX) else {
                return Err(PatchError::Unsupported(format!(
                    "unexpected entry in patch: {}",
                    name
                )));
            };
            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(corrupt)?;
            payloads.insert(id.to_string(), data);
        }

        let archive = Self { manifest, payloads };
        archive.validate()?;
        Ok(archive)
    }

    pub fn payload(&self, id: &str) -> Option<&[u8]> {
        self.payloads.get(id).map(Vec::as_slice)
    }

    /// Reject anything the applier could not carry out before any file is
    /// written.
    fn validate(&self) -> Result<(), PatchError> {
        for op in &self.manifest.operations {
            relative_path(op.path())?;

            if let Some(id) = op.payload() {
                if !self.payloads.contains_key(id) {
                    return Err(PatchError::Unsupported(format!(
                        "operation on {} references missing payload {}",
                        op.path(),
                        id
                    )));
                }
            }

            if let DeltaOperation::Add {
                kind,
                payload,
                target,
                ..
            } = op
            {
                match kind {
                    EntryKind::File if payload.is_none() => {
                        return Err(PatchError::Unsupported(format!(
                            "file {} added without payload",
                            op.path()
                        )))
                    }
                    EntryKind::Symlink => match target.as_deref() {
                        None => {
                            return Err(PatchError::Unsupported(format!(
                                "symlink {} added without target",
                                op.path()
                            )))
                        }
                        Some(t) if link_escapes(Path::new(op.path()), t) => {
                            return Err(PatchError::Unsupported(format!(
                                "symlink {} points outside the bundle: {}",
                                op.path(),
                                t
                            )))
                        }
                        Some(_) => {}
                    },
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

fn parse_manifest(raw: &[u8]) -> Result<DeltaManifest, PatchError> {
    // Check the version before the strict parse so newer formats report as
    // unsupported rather than malformed.
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|e| PatchError::Corrupt(e.to_string()))?;
    match value.get("format_version").and_then(|v| v.as_u64()) {
        Some(v) if v == u64::from(PATCH_FORMAT_VERSION) => {}
        Some(v) => {
            return Err(PatchError::Unsupported(format!(
                "patch format version {} (supported: {})",
                v, PATCH_FORMAT_VERSION
            )))
        }
        None => {
            return Err(PatchError::Unsupported(
                "patch manifest has no format version".to_string(),
            ))
        }
    }

    serde_json::from_value(value).map_err(|e| match e.classify() {
        Category::Data => PatchError::Unsupported(e.to_string()),
        _ => PatchError::Corrupt(e.to_string()),
    })
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String, PatchError> {
    let path = entry.path().map_err(corrupt)?;
    Ok(path.to_string_lossy().replace('\\', "/"))
}

fn corrupt(err: io::Error) -> PatchError {
    PatchError::Corrupt(err.to_string())
}

/// Validate a path from a manifest: relative, no `..`, not empty.
pub fn relative_path(path: &str) -> Result<PathBuf, PatchError> {
    let candidate = Path::new(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PatchError::Unsupported(format!(
                    "path escapes bundle: {}",
                    path
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(PatchError::Unsupported(format!("empty path: {:?}", path)));
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path() {
        assert_eq!(relative_path("a/b.txt").unwrap(), PathBuf::from("a/b.txt"));
        assert_eq!(relative_path("./a").unwrap(), PathBuf::from("a"));
        assert!(matches!(relative_path("/etc/passwd"), Err(PatchError::Unsupported(_))));
        assert!(matches!(relative_path("a/../../x"), Err(PatchError::Unsupported(_))));
        assert!(matches!(relative_path(""), Err(PatchError::Unsupported(_))));
        assert!(matches!(relative_path("."), Err(PatchError::Unsupported(_))));
    }

    #[test]
    fn test_unknown_op_is_unsupported() {
        let raw = br#"{
            "format_version": 1,
            "base_version": "1.0",
            "target_version": "1.1",
            "operations": [{ "op": "rename", "path": "a", "to": "b" }]
        }"#;
        assert!(matches!(parse_manifest(raw), Err(PatchError::Unsupported(_))));
    }

    #[test]
    fn test_future_format_is_unsupported() {
        let raw = br#"{ "format_version": 2, "base_version": "1.0",
            "target_version": "1.1", "operations": [] }"#;
        assert!(matches!(parse_manifest(raw), Err(PatchError::Unsupported(_))));
    }

    #[test]
    fn test_garbage_manifest_is_corrupt() {
        assert!(matches!(parse_manifest(b"{ not json"), Err(PatchError::Corrupt(_))));
    }

    #[test]
    fn test_operations_parse() {
        let raw = br#"{
            "format_version": 1,
            "base_version": "1.0",
            "target_version": "1.1",
            "operations": [
                { "op": "delete", "path": "old.txt" },
                { "op": "add", "path": "bin", "kind": "directory" },
                { "op": "set_mode", "path": "bin/tool", "mode": 493 }
            ]
        }"#;
        let manifest = parse_manifest(raw).unwrap();
        assert_eq!(manifest.operations.len(), 3);
        assert_eq!(manifest.operations[2].path(), "bin/tool");
    }

    fn symlink_patch(target: &str) -> PatchArchive {
        let manifest = DeltaManifest {
            format_version: PATCH_FORMAT_VERSION,
            base_version: "1.0".to_string(),
            target_version: "1.1".to_string(),
            base_tree_digest: None,
            target_tree_digest: None,
            operations: vec![DeltaOperation::Add {
                path: "Contents/link".to_string(),
                kind: EntryKind::Symlink,
                payload: None,
                target: Some(target.to_string()),
                mode: None,
                digest: None,
            }],
        };
        PatchArchive {
            manifest,
            payloads: HashMap::new(),
        }
    }

    #[test]
    fn test_escaping_symlink_targets_are_unsupported() {
        assert!(symlink_patch("Resources/icon").validate().is_ok());
        assert!(symlink_patch("../main").validate().is_ok());
        for target in ["/etc/passwd", "../../x", "Resources/../../../x"] {
            assert!(
                matches!(symlink_patch(target).validate(), Err(PatchError::Unsupported(_))),
                "{}",
                target
            );
        }
    }
}
