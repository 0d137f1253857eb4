//! Artifact Retrieval
//!
//! The coordinator asks a fetcher for artifact bytes on disk; how they get
//! there is up to the implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::error::FetchError;
use super::feed::ArtifactDescriptor;

#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Place the artifact inside `dest_dir` and return its path.
    async fn fetch(&self, artifact: &ArtifactDescriptor, dest_dir: &Path)
        -> Result<PathBuf, FetchError>;
}

/// Resolves `file://` URLs and plain filesystem paths.
#[derive(Debug, Clone, Default)]
pub struct LocalFetcher {
    /// Base for relative paths; the working directory when `None`.
    root: Option<PathBuf>,
}

impl LocalFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, FetchError> {
        let raw = if let Some(rest) = url.strip_prefix("file://") {
            rest
        } else if url.contains("://") {
            return Err(FetchError::UnsupportedUrl(url.to_string()));
        } else {
            url
        };
        let path = PathBuf::from(raw);
        Ok(match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path,
        })
    }
}

#[async_trait]
impl ArtifactFetcher for LocalFetcher {
    async fn fetch(
        &self,
        artifact: &ArtifactDescriptor,
        dest_dir: &Path,
    ) -> Result<PathBuf, FetchError> {
        let source = self.resolve(&artifact.url)?;
        if !fs::try_exists(&source).await? {
            return Err(FetchError::NotFound(source.display().to_string()));
        }

        let actual = fs::metadata(&source).await?.len();
        if actual != artifact.length {
            return Err(FetchError::LengthMismatch {
                expected: artifact.length,
                actual,
            });
        }

        fs::create_dir_all(dest_dir).await?;
        let name = artifact.file_name().unwrap_or("artifact");
        let dest = dest_dir.join(name);

        // Copy to a partial file first, then rename
        let partial = dest.with_extension("partial");
        fs::copy(&source, &partial).await?;
        fs::rename(&partial, &dest).await?;

        debug!("Fetched {} ({} bytes) to {:?}", artifact.url, actual, dest);
        Ok(dest)
    }
}
