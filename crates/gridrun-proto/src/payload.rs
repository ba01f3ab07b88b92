//! Typed payloads, one struct per message kind.

use crate::envelope::{MessageKind, WirePayload};
use gridrun_core::{CapabilitySnapshot, JobId, JobOutcome, JobSpec, JobStatus, RunnerId};
use serde::{Deserialize, Serialize};

/// Credential validation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialValidate {
    pub runner_id: RunnerId,
    pub token: String,
}

impl WirePayload for CredentialValidate {
    const KIND: MessageKind = MessageKind::CredentialValidate;
}

/// Credential validation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialResult {
    pub accepted: bool,
    /// Operator-facing rejection reason, if any.
    pub reason: Option<String>,
}

impl WirePayload for CredentialResult {
    const KIND: MessageKind = MessageKind::CredentialResult;
}

/// Runner registration request. The service replies with `RegisterResult`
/// and then re-offers any jobs still assigned to this runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub runner_id: RunnerId,
    pub hostname: String,
    pub version: String,
}

impl WirePayload for Register {
    const KIND: MessageKind = MessageKind::Register;
}

/// Runner registration response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResult {
    pub accepted: bool,
}

impl WirePayload for RegisterResult {
    const KIND: MessageKind = MessageKind::RegisterResult;
}

/// Ready-for-jobs announcement, sent once per connection epoch after
/// registration (and again after every reconnect).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub runner_id: RunnerId,
    /// How many more jobs this runner is willing to take right now.
    pub free_slots: u32,
}

impl WirePayload for Ready {
    const KIND: MessageKind = MessageKind::Ready;
}

/// Hardware/capability snapshot push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityPush {
    pub runner_id: RunnerId,
    pub snapshot: CapabilitySnapshot,
}

impl WirePayload for CapabilityPush {
    const KIND: MessageKind = MessageKind::CapabilityPush;
}

/// Periodic liveness signal. Epoch-local: never retried across reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub runner_id: RunnerId,
    /// Monotonic per-epoch sequence number, echoed back in the ack.
    pub sequence: u64,
    pub active_jobs: u32,
    /// Outgoing queue depth, for service-side visibility into backlog.
    pub queue_depth: u64,
}

impl WirePayload for Heartbeat {
    const KIND: MessageKind = MessageKind::Heartbeat;
}

/// Heartbeat acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub sequence: u64,
}

impl WirePayload for HeartbeatAck {
    const KIND: MessageKind = MessageKind::HeartbeatAck;
}

/// Job offered to this runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOffer {
    pub spec: JobSpec,
}

impl WirePayload for JobOffer {
    const KIND: MessageKind = MessageKind::JobOffer;
}

/// Offer accepted; the job is queued locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAccept {
    pub job_id: JobId,
}

impl WirePayload for JobAccept {
    const KIND: MessageKind = MessageKind::JobAccept;
}

/// Offer rejected; no local state was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReject {
    pub job_id: JobId,
    pub reason: String,
}

impl WirePayload for JobReject {
    const KIND: MessageKind = MessageKind::JobReject;
}

/// Job status transition. Exactly one is emitted per transition; terminal
/// statuses may be re-emitted after a reconnect and the service must treat
/// the repeat as idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Free-form progress detail (e.g. current stage output line count).
    pub detail: Option<String>,
}

impl WirePayload for JobStatusUpdate {
    const KIND: MessageKind = MessageKind::JobStatusUpdate;
}

/// Terminal job result, answered by `JobResultAck`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultReport {
    pub outcome: JobOutcome,
    /// References to uploaded output artifacts.
    pub artifacts: Vec<String>,
}

impl WirePayload for JobResultReport {
    const KIND: MessageKind = MessageKind::JobResultReport;
}

/// Service acknowledgment of a result report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultAck {
    pub job_id: JobId,
}

impl WirePayload for JobResultAck {
    const KIND: MessageKind = MessageKind::JobResultAck;
}

/// Termination request for a specific job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTerminate {
    pub job_id: JobId,
    pub reason: String,
}

impl WirePayload for JobTerminate {
    const KIND: MessageKind = MessageKind::JobTerminate;
}
