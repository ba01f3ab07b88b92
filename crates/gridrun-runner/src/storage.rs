//! Artifact storage collaborator.
//!
//! Jobs stage inputs and hand off outputs through this interface. All
//! operations are plain blocking-style I/O confined to a job's own task; the
//! interesting failure handling (bounded retries, terminal status) lives in
//! the job lifecycle, not here.

use async_trait::async_trait;
use gridrun_core::JobId;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info};

/// Artifact storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The reference does not resolve to a known artifact.
    #[error("Unknown artifact reference: {0}")]
    UnknownReference(String),
}

/// Scoped storage operations consumed by jobs and the job manager.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Create (or reuse) the working directory for a job.
    async fn create_job_dir(&self, id: &JobId) -> Result<PathBuf, StoreError>;

    /// Stage the artifact behind `reference` into `dest_dir`, returning the
    /// staged path.
    async fn fetch(&self, reference: &str, dest_dir: &Path) -> Result<PathBuf, StoreError>;

    /// Upload an output artifact, returning the reference it is reachable
    /// under.
    async fn upload(&self, id: &JobId, path: &Path) -> Result<String, StoreError>;

    /// Delete job directories older than `max_age`. Returns how many were
    /// removed.
    async fn cleanup_aged(&self, max_age: Duration) -> Result<usize, StoreError>;
}

/// Filesystem-backed store: job directories under `jobs_dir`, artifacts
/// resolved against a local mirror of the service's blob store.
pub struct LocalStore {
    jobs_dir: PathBuf,
    mirror_dir: PathBuf,
}

impl LocalStore {
    pub fn new(jobs_dir: impl Into<PathBuf>, mirror_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
            mirror_dir: mirror_dir.into(),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn create_job_dir(&self, id: &JobId) -> Result<PathBuf, StoreError> {
        let dir = self.jobs_dir.join(id.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn fetch(&self, reference: &str, dest_dir: &Path) -> Result<PathBuf, StoreError> {
        let source = self.mirror_dir.join(reference);
        if !source.is_file() {
            return Err(StoreError::UnknownReference(reference.to_string()));
        }
        let name = source
            .file_name()
            .ok_or_else(|| StoreError::UnknownReference(reference.to_string()))?;
        let dest = dest_dir.join(name);
        tokio::fs::copy(&source, &dest).await?;
        debug!(reference, dest = %dest.display(), "Staged artifact");
        Ok(dest)
    }

    async fn upload(&self, id: &JobId, path: &Path) -> Result<String, StoreError> {
        let name = path
            .file_name()
            .ok_or_else(|| StoreError::UnknownReference(path.display().to_string()))?;
        let upload_dir = self.mirror_dir.join("uploads").join(id.as_str());
        tokio::fs::create_dir_all(&upload_dir).await?;
        tokio::fs::copy(path, upload_dir.join(name)).await?;
        let reference = format!("uploads/{}/{}", id, name.to_string_lossy());
        debug!(%reference, "Uploaded artifact");
        Ok(reference)
    }

    async fn cleanup_aged(&self, max_age: Duration) -> Result<usize, StoreError> {
        let now = SystemTime::now();
        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&self.jobs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_dir() => meta,
                _ => continue,
            };
            let modified = match meta.modified() {
                Ok(t) => t,
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Cleaned up aged job directories");
        }
        Ok(removed)
    }
}
