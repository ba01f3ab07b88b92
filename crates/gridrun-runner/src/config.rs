//! Persisted runner configuration and credentials.

use gridrun_core::RunnerId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::connection::{Backoff, ConnectionConfig, Credentials};
use crate::job::{JobPolicy, ManagerConfig};

/// Fatal configuration errors. Only raised at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but cannot be read or written.
    #[error("Cannot access config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file exists but does not parse.
    #[error("Cannot parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Runner configuration, persisted as JSON in the config directory. Missing
/// file means defaults; missing fields fall back individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Stable identity of this runner.
    pub runner_id: RunnerId,

    /// Token presented during credential validation.
    pub runner_token: String,

    /// Coordination service endpoint, `host:port`.
    pub endpoint: String,

    /// Seconds between heartbeats while connected.
    pub heartbeat_interval_secs: u64,

    /// Unacknowledged heartbeats tolerated before reconnecting.
    pub heartbeat_miss_limit: u32,

    /// First reconnect delay in milliseconds.
    pub reconnect_initial_delay_ms: u64,

    /// Reconnect delay cap in seconds.
    pub reconnect_max_delay_secs: u64,

    /// Multiplicative backoff growth per attempt.
    pub reconnect_backoff_factor: f64,

    /// Jitter fraction applied to reconnect delays.
    pub reconnect_jitter: f64,

    /// Transport dial timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Outgoing queue depth that triggers a growth warning.
    pub queue_warn_depth: usize,

    /// Maximum jobs executing concurrently.
    pub max_concurrent_jobs: u32,

    /// Input staging attempts before a job fails.
    pub fetch_retries: u32,

    /// Result report attempts before a job fails.
    pub upload_retries: u32,

    /// Seconds to wait for a result acknowledgment per attempt.
    pub result_ack_timeout_secs: u64,

    /// Seconds between a graceful stop request and a forced kill.
    pub terminate_grace_secs: u64,

    /// Seconds between progress reports for a running job.
    pub progress_interval_secs: u64,

    /// Seconds between capability re-collections.
    pub capability_poll_interval_secs: u64,

    /// Job directories older than this many days are cleaned up at startup.
    pub job_dir_max_age_days: u64,

    /// Local mirror of the service's artifact store.
    pub artifact_mirror: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: RunnerId::generate(),
            runner_token: String::new(),
            endpoint: "127.0.0.1:7440".to_string(),
            heartbeat_interval_secs: 60,
            heartbeat_miss_limit: 2,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_secs: 60,
            reconnect_backoff_factor: 2.0,
            reconnect_jitter: 0.2,
            connect_timeout_secs: 10,
            queue_warn_depth: 1024,
            max_concurrent_jobs: 4,
            fetch_retries: 3,
            upload_retries: 3,
            result_ack_timeout_secs: 30,
            terminate_grace_secs: 10,
            progress_interval_secs: 30,
            capability_poll_interval_secs: 300,
            job_dir_max_age_days: 7,
            artifact_mirror: None,
        }
    }
}

impl RunnerConfig {
    /// Load from `path`. A missing file yields defaults (which are persisted
    /// back on shutdown); an unreadable or unparseable file is fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Persist to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, data).map_err(io_err)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            runner_id: self.runner_id.clone(),
            token: self.runner_token.clone(),
        }
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_miss_limit: self.heartbeat_miss_limit,
            backoff: Backoff {
                initial: Duration::from_millis(self.reconnect_initial_delay_ms),
                max: Duration::from_secs(self.reconnect_max_delay_secs),
                factor: self.reconnect_backoff_factor,
                jitter: self.reconnect_jitter,
            },
            handshake_timeout: Duration::from_secs(self.connect_timeout_secs),
            queue_warn_depth: self.queue_warn_depth,
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }

    pub fn job_policy(&self) -> JobPolicy {
        JobPolicy {
            fetch_retries: self.fetch_retries,
            upload_retries: self.upload_retries,
            result_ack_timeout: Duration::from_secs(self.result_ack_timeout_secs),
            terminate_grace: Duration::from_secs(self.terminate_grace_secs),
            progress_interval: Duration::from_secs(self.progress_interval_secs),
        }
    }

    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            capability_poll_interval: Duration::from_secs(self.capability_poll_interval_secs),
            job_dir_max_age: Duration::from_secs(self.job_dir_max_age_days * 86_400),
        }
    }
}
