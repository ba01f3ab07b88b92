//! The immutable unit of communication.

use chrono::{DateTime, Utc};
use gridrun_core::Priority;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire-level errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying stream error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame exceeded the configured maximum length.
    #[error("Frame too long")]
    FrameTooLong,

    /// The envelope kind did not match the requested payload type.
    #[error("Kind mismatch: expected {expected}, got {got}")]
    KindMismatch { expected: MessageKind, got: MessageKind },
}

/// Discriminator used to route an envelope to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Credential validation request (runner -> service).
    CredentialValidate,
    /// Credential validation response.
    CredentialResult,
    /// Runner registration request.
    Register,
    /// Runner registration response.
    RegisterResult,
    /// Ready-for-jobs announcement.
    Ready,
    /// Hardware/capability snapshot push.
    CapabilityPush,
    /// Periodic liveness signal.
    Heartbeat,
    /// Heartbeat acknowledgment.
    HeartbeatAck,
    /// Job offered to this runner.
    JobOffer,
    /// Offer accepted.
    JobAccept,
    /// Offer rejected.
    JobReject,
    /// Job status transition.
    JobStatusUpdate,
    /// Terminal job result.
    JobResultReport,
    /// Service acknowledgment of a result report.
    JobResultAck,
    /// Termination request for a specific job.
    JobTerminate,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A typed payload that knows which envelope kind carries it.
pub trait WirePayload: Serialize + DeserializeOwned {
    /// The envelope kind this payload travels under.
    const KIND: MessageKind;
}

/// Immutable unit of communication: payload, type tag, priority.
///
/// Envelopes are never mutated once enqueued. The `epoch_local` flag is local
/// delivery metadata and does not travel on the wire: an epoch-local envelope
/// is dropped rather than retried when the connection epoch it was queued in
/// ends (heartbeats are the canonical example).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing discriminator.
    pub kind: MessageKind,

    /// Queue priority. Lower value drains first.
    pub priority: Priority,

    /// Opaque payload, decoded on demand by kind.
    pub payload: serde_json::Value,

    /// When the sender built the envelope.
    pub sent_at: DateTime<Utc>,

    /// Drop instead of retrying across a reconnection.
    #[serde(skip)]
    pub epoch_local: bool,
}

impl Envelope {
    /// Encode a typed payload into an envelope at the given priority.
    pub fn encode<P: WirePayload>(priority: Priority, payload: &P) -> Result<Self, WireError> {
        Ok(Self {
            kind: P::KIND,
            priority,
            payload: serde_json::to_value(payload)?,
            sent_at: Utc::now(),
            epoch_local: false,
        })
    }

    /// Mark this envelope as valid only within the current connection epoch.
    pub fn epoch_local(mut self) -> Self {
        self.epoch_local = true;
        self
    }

    /// Decode the payload, checking the envelope kind first.
    pub fn decode<P: WirePayload>(&self) -> Result<P, WireError> {
        if self.kind != P::KIND {
            return Err(WireError::KindMismatch {
                expected: P::KIND,
                got: self.kind,
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
