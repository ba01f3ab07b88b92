//! GridRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/transport
//! - Filesystem
//! - Runtime specifics
//!
//! All types here represent the core business domain of GridRun.

pub mod capability;
pub mod error;
pub mod ids;
pub mod job;
pub mod message;
pub mod status;

// Re-export commonly used types
pub use capability::{CapabilitySnapshot, ResourceClaim};
pub use error::CoreError;
pub use ids::{JobId, RunnerId};
pub use job::{FailureReason, JobOutcome, JobSpec};
pub use message::Priority;
pub use status::{ConnectionState, JobStatus};
