//! Core domain errors.

use thiserror::Error;

/// Core domain errors for GridRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
