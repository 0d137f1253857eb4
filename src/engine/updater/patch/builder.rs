//! Patch creation from two bundle trees, for tests and fixtures.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

use super::format::{
    DeltaManifest, DeltaOperation, EntryKind, MANIFEST_ENTRY, PATCH_FORMAT_VERSION,
    PAYLOAD_PREFIX,
};
use super::tree::{file_digest, mode_of, relative_name, tree_digest};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File { path: PathBuf, mode: u32 },
    Directory { mode: u32 },
    Symlink { target: String },
}

impl Node {
    fn kind(&self) -> EntryKind {
        match self {
            Node::File { .. } => EntryKind::File,
            Node::Directory { .. } => EntryKind::Directory,
            Node::Symlink { .. } => EntryKind::Symlink,
        }
    }
}

/// Builds a delta container that turns `base` into `target`.
#[derive(Debug, Clone)]
pub struct DeltaBuilder {
    base_version: String,
    target_version: String,
    tree_digests: bool,
}

impl DeltaBuilder {
    pub fn new(base_version: impl Into<String>, target_version: impl Into<String>) -> Self {
        Self {
            base_version: base_version.into(),
            target_version: target_version.into(),
            tree_digests: true,
        }
    }

    /// Omit whole-tree digests; per-file digests still apply.
    pub fn without_tree_digests(mut self) -> Self {
        self.tree_digests = false;
        self
    }

    /// Compute the manifest and payloads without writing anything.
    pub fn diff(&self, base: &Path, target: &Path) -> io::Result<(DeltaManifest, Vec<Vec<u8>>)> {
        let old = scan(base)?;
        let new = scan(target)?;
        let mut operations = Vec::new();
        let mut payloads: Vec<Vec<u8>> = Vec::new();

        // Deepest paths first so directories are emptied before removal.
        let mut removed: Vec<&String> = old
            .iter()
            .filter(|(path, node)| match new.get(*path) {
                None => true,
                Some(other) => other.kind() != node.kind(),
            })
            .map(|(path, _)| path)
            .collect();
        removed.sort_by(|a, b| b.cmp(a));
        for path in removed {
            // Children of a removed directory go with it.
            if removed_ancestor(&old, &new, path) {
                continue;
            }
            let digest = match &old[path] {
                Node::File { path: file, .. } => Some(file_digest(file)?),
                _ => None,
            };
            operations.push(DeltaOperation::Delete {
                path: path.clone(),
                digest,
            });
        }

        for (path, node) in &new {
            let previous = old.get(path).filter(|prev| prev.kind() == node.kind());
            match (node, previous) {
                (Node::Directory { mode }, None) => operations.push(DeltaOperation::Add {
                    path: path.clone(),
                    kind: EntryKind::Directory,
                    payload: None,
                    target: None,
                    mode: Some(*mode),
                    digest: None,
                }),
                (Node::File { path: file, mode }, None) => {
                    let data = fs::read(file)?;
                    operations.push(DeltaOperation::Add {
                        path: path.clone(),
                        kind: EntryKind::File,
                        payload: Some(payloads.len().to_string()),
                        target: None,
                        mode: Some(*mode),
                        digest: Some(file_digest(file)?),
                    });
                    payloads.push(data);
                }
                (Node::Symlink { target }, None) => operations.push(DeltaOperation::Add {
                    path: path.clone(),
                    kind: EntryKind::Symlink,
                    payload: None,
                    target: Some(target.clone()),
                    mode: None,
                    digest: None,
                }),
                (
                    Node::File { path: file, mode },
                    Some(Node::File {
                        path: old_file,
                        mode: old_mode,
                    }),
                ) => {
                    let old_data = fs::read(old_file)?;
                    let new_data = fs::read(file)?;
                    if old_data != new_data {
                        let mut diff = Vec::new();
                        bsdiff::diff(&old_data, &new_data, &mut diff)?;
                        operations.push(DeltaOperation::Modify {
                            path: path.clone(),
                            base_digest: file_digest(old_file)?,
                            payload: payloads.len().to_string(),
                            digest: file_digest(file)?,
                            mode: (mode != old_mode).then_some(*mode),
                        });
                        payloads.push(diff);
                    } else if mode != old_mode {
                        operations.push(DeltaOperation::SetMode {
                            path: path.clone(),
                            mode: *mode,
                        });
                    }
                }
                (Node::Directory { mode }, Some(Node::Directory { mode: old_mode })) => {
                    if mode != old_mode {
                        operations.push(DeltaOperation::SetMode {
                            path: path.clone(),
                            mode: *mode,
                        });
                    }
                }
                (Node::Symlink { target }, Some(Node::Symlink { target: old_target })) => {
                    if target != old_target {
                        operations.push(DeltaOperation::Delete {
                            path: path.clone(),
                            digest: None,
                        });
                        operations.push(DeltaOperation::Add {
                            path: path.clone(),
                            kind: EntryKind::Symlink,
                            payload: None,
                            target: Some(target.clone()),
                            mode: None,
                            digest: None,
                        });
                    }
                }
                _ => {}
            }
        }

        let (base_tree_digest, target_tree_digest) = if self.tree_digests {
            (Some(tree_digest(base)?), Some(tree_digest(target)?))
        } else {
            (None, None)
        };

        let manifest = DeltaManifest {
            format_version: PATCH_FORMAT_VERSION,
            base_version: self.base_version.clone(),
            target_version: self.target_version.clone(),
            base_tree_digest,
            target_tree_digest,
            operations,
        };
        Ok((manifest, payloads))
    }

    /// Diff the trees and write the container to `out`.
    pub fn build(&self, base: &Path, target: &Path, out: &Path) -> io::Result<DeltaManifest> {
        let (manifest, payloads) = self.diff(base, target)?;
        write_patch(&manifest, &payloads, out)?;
        Ok(manifest)
    }
}

/// Write a container with fixed headers, so equal input gives equal bytes.
pub fn write_patch(manifest: &DeltaManifest, payloads: &[Vec<u8>], out: &Path) -> io::Result<()> {
    let file = File::create(out)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let json = serde_json::to_vec_pretty(manifest)?;
    append(&mut builder, MANIFEST_ENTRY, &json)?;
    for (index, data) in payloads.iter().enumerate() {
        append(&mut builder, &format!("{}{}", PAYLOAD_PREFIX, index), data)?;
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

fn append<W: io::Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, name, data)
}

fn scan(root: &Path) -> io::Result<BTreeMap<String, Node>> {
    let mut nodes = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let name = relative_name(root, entry.path())?;
        let file_type = entry.file_type();
        let node = if file_type.is_symlink() {
            Node::Symlink {
                target: fs::read_link(entry.path())?.to_string_lossy().into_owned(),
            }
        } else if file_type.is_dir() {
            Node::Directory {
                mode: mode_of(&entry.metadata().map_err(io::Error::from)?),
            }
        } else {
            Node::File {
                path: entry.path().to_path_buf(),
                mode: mode_of(&entry.metadata().map_err(io::Error::from)?),
            }
        };
        nodes.insert(name, node);
    }
    Ok(nodes)
}

fn removed_ancestor(
    old: &BTreeMap<String, Node>,
    new: &BTreeMap<String, Node>,
    path: &str,
) -> bool {
    let mut current = path;
    while let Some((parent, _)) = current.rsplit_once('/') {
        let gone = match (old.get(parent), new.get(parent)) {
            (Some(Node::Directory { .. }), Some(Node::Directory { .. })) => false,
            (Some(Node::Directory { .. }), _) => true,
            _ => false,
        };
        if gone {
            return true;
        }
        current = parent;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_identical_trees_produce_no_operations() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        fs::create_dir_all(a.join("sub")).unwrap();
        fs::write(a.join("sub/f"), b"x").unwrap();
        let b = dir.path().join("b");
        super::super::tree::copy_tree(&a, &b).unwrap();

        let (manifest, payloads) = DeltaBuilder::new("1", "1").diff(&a, &b).unwrap();
        assert!(manifest.operations.is_empty());
        assert!(payloads.is_empty());
    }

    #[test]
    fn test_removed_directory_is_single_delete() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        fs::create_dir_all(a.join("gone/deep")).unwrap();
        fs::write(a.join("gone/deep/f"), b"x").unwrap();
        let b = dir.path().join("b");
        fs::create_dir_all(&b).unwrap();

        let (manifest, _) = DeltaBuilder::new("1", "2").diff(&a, &b).unwrap();
        assert_eq!(
            manifest.operations,
            vec![DeltaOperation::Delete {
                path: "gone".to_string(),
                digest: None
            }]
        );
    }

    #[test]
    fn test_build_is_byte_identical() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("f"), b"hello").unwrap();
        fs::write(b.join("f"), b"hello world").unwrap();

        let builder = DeltaBuilder::new("1", "2");
        builder.build(&a, &b, &dir.path().join("one")).unwrap();
        builder.build(&a, &b, &dir.path().join("two")).unwrap();
        assert_eq!(
            fs::read(dir.path().join("one")).unwrap(),
            fs::read(dir.path().join("two")).unwrap()
        );
    }
}
