//! Runner directory layout.

use std::io;
use std::path::{Path, PathBuf};

/// Directory structure for the runner's local state. Created on startup;
/// existing directories are fine.
#[derive(Debug, Clone)]
pub struct WorkDirs {
    root: PathBuf,
    cache_dir: PathBuf,
    config_dir: PathBuf,
    log_dir: PathBuf,
    jobs_dir: PathBuf,
}

impl WorkDirs {
    /// Set up the directory tree under `root`, creating anything missing.
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let dirs = Self {
            cache_dir: root.join("cache"),
            config_dir: root.join("config"),
            log_dir: root.join("logs"),
            jobs_dir: root.join("jobs"),
            root,
        };
        for dir in [
            &dirs.root,
            &dirs.cache_dir,
            &dirs.config_dir,
            &dirs.log_dir,
            &dirs.jobs_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(dirs)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache directory (capability snapshot cache lives here).
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Configuration directory (persisted runner config and credentials).
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    #[allow(dead_code)] // Reserved for file logging
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Parent of all per-job working directories.
    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Default location of the persisted runner config.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("runner.json")
    }

    /// Location of the capability snapshot cache.
    pub fn capability_cache(&self) -> PathBuf {
        self.cache_dir.join("capability.json")
    }
}
