//! GridRun wire types and codec.
//!
//! This crate contains:
//! - The `Envelope` unit of communication (payload, type tag, priority)
//! - One serde payload struct per message kind
//! - A newline-delimited JSON codec for framing envelopes over a byte stream
//!
//! The coordination service speaks the same envelope format; nothing here
//! assumes which side of the connection it is on.

pub mod codec;
pub mod envelope;
pub mod payload;

// Re-export commonly used types
pub use codec::{EnvelopeCodec, FramedEnvelope};
pub use envelope::{Envelope, MessageKind, WireError, WirePayload};
pub use payload::{
    CapabilityPush, CredentialResult, CredentialValidate, Heartbeat, HeartbeatAck, JobAccept,
    JobOffer, JobReject, JobResultAck, JobResultReport, JobStatusUpdate, JobTerminate, Ready,
    Register, RegisterResult,
};
