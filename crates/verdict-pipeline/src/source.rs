//! Artifact intake.
//!
//! [`DataSource`] is the seam for loaders of any kind (catalogs, object
//! stores). [`FsDataSource`] reads files, optionally walking directories and
//! filtering by glob.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use verdict_types::{Artifact, Result, VerdictError};

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Load one artifact. Used only at intake.
    async fn load(&self, locator: &str) -> Result<Artifact>;
}

/// Loads artifacts from the local filesystem; ids are content hashes.
pub struct FsDataSource {
    filter: Option<GlobSet>,
}

impl FsDataSource {
    /// Directory walks keep files matching any of `patterns` (relative to the
    /// walked directory). No patterns keeps every file.
    pub fn new(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self { filter: None });
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| VerdictError::Config(format!("invalid glob '{pattern}': {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| VerdictError::Config(format!("invalid glob set: {e}")))?;
        Ok(Self { filter: Some(set) })
    }

    /// Expand `input` into the files to load, sorted. An explicit file is
    /// always kept; a directory is walked recursively and filtered.
    pub async fn discover(&self, input: &Path) -> Result<Vec<PathBuf>> {
        let meta = tokio::fs::metadata(input).await?;
        if meta.is_file() {
            return Ok(vec![input.to_path_buf()]);
        }
        let mut found = Vec::new();
        self.walk(input, input, &mut found).await?;
        found.sort();
        Ok(found)
    }

    async fn walk(&self, base: &Path, current: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
        let meta = tokio::fs::metadata(current).await?;
        if meta.is_file() {
            let keep = match (&self.filter, current.strip_prefix(base)) {
                (None, _) => true,
                (Some(set), Ok(rel)) => set.is_match(rel),
                (Some(_), Err(_)) => false,
            };
            if keep {
                found.push(current.to_path_buf());
            }
        } else if meta.is_dir() {
            let mut entries = tokio::fs::read_dir(current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if !hidden {
                    Box::pin(self.walk(base, &entry.path(), found)).await?;
                }
            }
        }
        Ok(())
    }

    /// Discover and load every input. Artifacts with identical content are
    /// loaded once.
    pub async fn load_all(&self, inputs: &[PathBuf]) -> Result<Vec<Artifact>> {
        let mut seen = HashSet::new();
        let mut artifacts = Vec::new();
        for input in inputs {
            for path in self.discover(input).await? {
                let artifact = self.load_path(&path).await?;
                if seen.insert(artifact.id.clone()) {
                    artifacts.push(artifact);
                } else {
                    tracing::warn!(
                        path = %path.display(),
                        artifact = %artifact.id.short(),
                        "Skipping duplicate artifact content"
                    );
                }
            }
        }
        Ok(artifacts)
    }

    pub async fn load_path(&self, path: &Path) -> Result<Artifact> {
        let content = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        Ok(Artifact::from_bytes(name, content).with_source(path))
    }
}

#[async_trait]
impl DataSource for FsDataSource {
    async fn load(&self, locator: &str) -> Result<Artifact> {
        self.load_path(Path::new(locator)).await
    }
}
