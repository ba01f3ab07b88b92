//! Job specification and outcome types.

use crate::{JobId, Priority, ResourceClaim};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Specification of one admitted unit of work, as carried by a job offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique job identifier, assigned by the coordination service.
    pub id: JobId,

    /// Executable to launch.
    pub command: String,

    /// Arguments passed to the executable.
    pub args: Vec<String>,

    /// Environment variables set for the subprocess.
    pub env: HashMap<String, String>,

    /// Queue priority carried from the offer. Lower is more urgent.
    pub priority: Priority,

    /// Resources the job declares it needs.
    pub resources: ResourceClaim,

    /// References to input artifacts staged before launch.
    pub inputs: Vec<String>,

    /// Glob-like patterns selecting output artifacts to upload.
    pub outputs: Vec<String>,

    /// When the service created the job.
    pub created_at: DateTime<Utc>,
}

impl JobSpec {
    /// Create a new spec with a generated id and default priority.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: JobId::generate(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            priority: Priority::default(),
            resources: ResourceClaim::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Builder method to set a specific id (useful for testing).
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Builder method to add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set the resource claim.
    pub fn with_resources(mut self, resources: ResourceClaim) -> Self {
        self.resources = resources;
        self
    }

    /// Builder method to add an input artifact reference.
    pub fn with_input(mut self, reference: impl Into<String>) -> Self {
        self.inputs.push(reference.into());
        self
    }
}

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Input artifacts could not be staged within the retry budget.
    ResourceError,
    /// The subprocess could not be spawned.
    LaunchError,
    /// The subprocess exited non-zero.
    NonZeroExit,
    /// Results could not be uploaded or acknowledged within the retry budget.
    UploadError,
    /// The job exceeded its allotted time.
    Timeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ResourceError => "resource error",
            Self::LaunchError => "launch error",
            Self::NonZeroExit => "non-zero exit",
            Self::UploadError => "upload error",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Final record of a job run, reported upstream with the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    /// The job this outcome belongs to.
    pub job_id: JobId,

    /// Subprocess exit code, if it ran to exit.
    pub exit_code: Option<i32>,

    /// Failure classification, absent on success.
    pub failure: Option<FailureReason>,

    /// When the terminal state was reached.
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    /// Successful outcome for a zero exit.
    pub fn success(job_id: JobId, exit_code: i32) -> Self {
        Self {
            job_id,
            exit_code: Some(exit_code),
            failure: None,
            finished_at: Utc::now(),
        }
    }

    /// Failed outcome with a reason and optional exit code.
    pub fn failure(job_id: JobId, reason: FailureReason, exit_code: Option<i32>) -> Self {
        Self {
            job_id,
            exit_code,
            failure: Some(reason),
            finished_at: Utc::now(),
        }
    }
}
