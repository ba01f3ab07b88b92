//! Status enums for Jobs and the coordination-service connection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Job on this runner.
///
/// The nominal path is `Pending -> FetchingResources -> Running -> Uploading
/// -> Completed`. `Failed` and `Terminated` are terminal side-paths reachable
/// from every non-terminal state; no other transition may skip a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Job admitted but not yet launched.
    #[default]
    Pending,
    /// Staging input artifacts into the job directory.
    FetchingResources,
    /// Subprocess is executing.
    Running,
    /// Collecting and uploading result artifacts.
    Uploading,
    /// Job finished and the service acknowledged the result.
    Completed,
    /// Unrecoverable local error at any stage.
    Failed,
    /// Externally requested cancellation.
    Terminated,
}

impl JobStatus {
    /// Returns true if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    /// Returns true if `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed | JobStatus::Terminated => true,
            JobStatus::FetchingResources => *self == JobStatus::Pending,
            JobStatus::Running => *self == JobStatus::FetchingResources,
            JobStatus::Uploading => *self == JobStatus::Running,
            JobStatus::Completed => *self == JobStatus::Uploading,
            JobStatus::Pending => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::FetchingResources => "fetching_resources",
            Self::Running => "running",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// State of the single logical connection to the coordination service.
///
/// Owned exclusively by the connection manager; transitions only through its
/// internal logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No transport established.
    #[default]
    Disconnected,
    /// Transport up, credentials in flight.
    Authenticating,
    /// Authenticated and heart-beating.
    Active,
    /// Transport lost, retrying with backoff.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_path_is_valid() {
        let path = [
            JobStatus::Pending,
            JobStatus::FetchingResources,
            JobStatus::Running,
            JobStatus::Uploading,
            JobStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_stage_skipping() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::FetchingResources.can_transition_to(JobStatus::Uploading));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_failure_reachable_from_any_non_terminal() {
        for from in [
            JobStatus::Pending,
            JobStatus::FetchingResources,
            JobStatus::Running,
            JobStatus::Uploading,
        ] {
            assert!(from.can_transition_to(JobStatus::Failed));
            assert!(from.can_transition_to(JobStatus::Terminated));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Terminated] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(JobStatus::Pending));
            assert!(!terminal.can_transition_to(JobStatus::Failed));
        }
    }
}
