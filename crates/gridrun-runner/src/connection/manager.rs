//! Connection manager: owns the lifecycle of the single logical connection
//! to the coordination service.
//!
//! Exactly one manager exists per runner process. It dials the transport,
//! authenticates, registers, announces readiness, and then runs one
//! connection epoch: an outbound drain loop feeding the socket from the
//! priority queue and an inbound loop dispatching messages to registered
//! observers, with a heartbeat on a fixed interval. Transport failures never
//! escape as errors; they collapse the epoch and drive the reconnect loop
//! with bounded exponential backoff. Senders keep enqueueing throughout.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use gridrun_core::{ConnectionState, Priority, RunnerId};
use gridrun_proto::codec::frame;
use gridrun_proto::{
    CredentialResult, CredentialValidate, Envelope, FramedEnvelope, Heartbeat, HeartbeatAck,
    MessageKind, Ready, Register, RegisterResult, WirePayload,
};

use super::backoff::Backoff;
use super::observers::{ObserverFn, ObserverRegistry};
use super::queue::OutboundQueue;
use super::transport::{Duplex, Transport};

/// Failure to establish an authenticated session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Credentials or registration rejected. Not retryable.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Transport-level failure. Retryable via the reconnect loop.
    #[error("Transport failure: {0}")]
    Transport(String),
}

/// Runner credentials presented during the handshake.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub runner_id: RunnerId,
    pub token: String,
}

/// Tunables for the connection layer.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between heartbeats while `Active`.
    pub heartbeat_interval: Duration,

    /// Consecutive unacknowledged heartbeats before the epoch is declared
    /// dead.
    pub heartbeat_miss_limit: u32,

    /// Reconnection backoff policy.
    pub backoff: Backoff,

    /// Per-step handshake timeout.
    pub handshake_timeout: Duration,

    /// Queue depth at which growth is logged. The queue itself is unbounded.
    pub queue_warn_depth: usize,

    /// Job slots advertised in the ready announcement.
    pub max_concurrent_jobs: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_miss_limit: 2,
            backoff: Backoff::default(),
            handshake_timeout: Duration::from_secs(10),
            queue_warn_depth: 1024,
            max_concurrent_jobs: 4,
        }
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    queue: OutboundQueue,
    observers: ObserverRegistry,
    active_jobs: AtomicU32,
    queue_warn_depth: usize,
}

/// Cheap handle onto the connection layer, passed to the job manager and to
/// every job. Sends never block; they enqueue and return.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Enqueue an envelope for delivery. Returns immediately; delivery is
    /// asynchronous and survives reconnects unless the envelope is marked
    /// epoch-local.
    pub fn send(&self, envelope: Envelope) {
        self.shared.queue.push(envelope);
        let depth = self.shared.queue.depth();
        if depth == self.shared.queue_warn_depth {
            warn!(depth, "Outgoing queue is growing; service unreachable?");
        }
    }

    /// Register an inbound handler for a message kind under a caller-chosen
    /// name. Idempotent.
    pub fn register_observer(&self, kind: MessageKind, name: impl Into<String>, f: ObserverFn) {
        self.shared.observers.register(kind, name, f);
    }

    /// Remove a previously registered handler. Unknown pairs are a no-op.
    pub fn unregister_observer(&self, kind: MessageKind, name: &str) {
        self.shared.observers.unregister(kind, name);
    }

    /// Current connection state.
    #[allow(dead_code)] // Exposed for operator surfaces
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state transitions.
    #[allow(dead_code)] // Exposed for operator surfaces
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Report the number of active jobs, included in heartbeats and ready
    /// announcements.
    pub fn set_active_jobs(&self, count: u32) {
        self.shared.active_jobs.store(count, Ordering::Relaxed);
    }

    /// Depth of the outgoing queue.
    #[allow(dead_code)] // Exposed for operator surfaces
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.depth()
    }

    /// Close the session: the run loop flushes what it can and exits.
    pub fn close(&self) {
        let _ = self.shared.shutdown.send(true);
    }
}

enum EpochEnd {
    TransportLost,
    Shutdown,
}

/// The connection manager. Construct once, `start` it, then interact through
/// the [`ConnectionHandle`].
pub struct ConnectionManager {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    config: ConnectionConfig,
    hostname: String,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Credentials,
        config: ConnectionConfig,
        hostname: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        let queue_warn_depth = config.queue_warn_depth;
        Self {
            shared: Arc::new(Shared {
                state,
                shutdown,
                queue: OutboundQueue::new(),
                observers: ObserverRegistry::new(),
                active_jobs: AtomicU32::new(0),
                queue_warn_depth,
            }),
            transport,
            credentials,
            config,
            hostname: hostname.into(),
        }
    }

    /// Handle for senders and observer registration.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Establish the first authenticated session and hand the connection off
    /// to a background task. Both authentication rejection and transport
    /// failure on this first attempt are surfaced to the caller; afterwards
    /// transport failures are absorbed by the reconnect loop.
    pub async fn start(self) -> Result<(ConnectionHandle, tokio::task::JoinHandle<()>), ConnectError>
    {
        // The first ready announcement belongs to the job manager, after the
        // capability snapshot went upstream; reconnects re-announce here.
        let framed = self.establish(false).await?;
        let handle = self.handle();
        let join = tokio::spawn(self.run(framed));
        Ok((handle, join))
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = self.shared.state.send_replace(state);
        if prev != state {
            info!(from = %prev, to = %state, "Connection state");
        }
    }

    fn free_slots(&self) -> u32 {
        self.config
            .max_concurrent_jobs
            .saturating_sub(self.shared.active_jobs.load(Ordering::Relaxed))
    }

    /// Dial, authenticate and register; optionally re-announce readiness.
    /// One attempt.
    async fn establish(
        &self,
        announce_ready: bool,
    ) -> Result<FramedEnvelope<Box<dyn Duplex>>, ConnectError> {
        let io = self
            .transport
            .connect()
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        let mut framed = frame(io);
        // During a reconnect the credential exchange happens under the
        // `Reconnecting` state; `Authenticating` belongs to the first session.
        if *self.shared.state.borrow() == ConnectionState::Disconnected {
            self.set_state(ConnectionState::Authenticating);
        }

        let validate = CredentialValidate {
            runner_id: self.credentials.runner_id.clone(),
            token: self.credentials.token.clone(),
        };
        self.send_direct(&mut framed, &validate).await?;
        let result: CredentialResult = self.expect_reply(&mut framed).await?;
        if !result.accepted {
            return Err(ConnectError::Auth(
                result.reason.unwrap_or_else(|| "credentials rejected".into()),
            ));
        }

        let register = Register {
            runner_id: self.credentials.runner_id.clone(),
            hostname: self.hostname.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        self.send_direct(&mut framed, &register).await?;
        let result: RegisterResult = self.expect_reply(&mut framed).await?;
        if !result.accepted {
            return Err(ConnectError::Auth("registration rejected".into()));
        }

        if announce_ready {
            let ready = Ready {
                runner_id: self.credentials.runner_id.clone(),
                free_slots: self.free_slots(),
            };
            self.send_direct(&mut framed, &ready).await?;
        }

        self.set_state(ConnectionState::Active);
        Ok(framed)
    }

    async fn send_direct<P: WirePayload>(
        &self,
        framed: &mut FramedEnvelope<Box<dyn Duplex>>,
        payload: &P,
    ) -> Result<(), ConnectError> {
        let envelope = Envelope::encode(Priority::CONTROL, payload)
            .map_err(|e| ConnectError::Transport(e.to_string()))?;
        framed
            .send(envelope)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))
    }

    /// Wait for the next envelope of the expected kind; anything else that
    /// arrives mid-handshake is dispatched to observers rather than dropped.
    async fn expect_reply<P: WirePayload>(
        &self,
        framed: &mut FramedEnvelope<Box<dyn Duplex>>,
    ) -> Result<P, ConnectError> {
        let deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(ConnectError::Transport("handshake timed out".into()));
                }
                inbound = framed.next() => match inbound {
                    Some(Ok(envelope)) if envelope.kind == P::KIND => {
                        return envelope
                            .decode()
                            .map_err(|e| ConnectError::Transport(e.to_string()));
                    }
                    Some(Ok(envelope)) => self.shared.observers.dispatch(&envelope),
                    Some(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
                    None => {
                        return Err(ConnectError::Transport(
                            "connection closed during handshake".into(),
                        ));
                    }
                },
            }
        }
    }

    async fn run(self, first: FramedEnvelope<Box<dyn Duplex>>) {
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut current = Some(first);

        loop {
            let mut framed = match current.take() {
                Some(framed) => framed,
                None => match self.reconnect(&mut shutdown).await {
                    Some(framed) => framed,
                    None => break,
                },
            };

            match self.run_epoch(&mut framed, &mut shutdown).await {
                EpochEnd::Shutdown => {
                    self.flush(&mut framed).await;
                    break;
                }
                EpochEnd::TransportLost => {
                    self.shared.queue.drop_epoch_local();
                    self.set_state(ConnectionState::Reconnecting);
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Connection manager stopped");
    }

    /// Retry `establish` with backoff until success, shutdown, or a fatal
    /// authentication rejection.
    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<FramedEnvelope<Box<dyn Duplex>>> {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return None;
            }
            let delay = self.config.backoff.delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return None,
            }

            match self.establish(true).await {
                Ok(framed) => return Some(framed),
                Err(ConnectError::Auth(reason)) => {
                    error!(%reason, "Authentication rejected during reconnect; giving up");
                    return None;
                }
                Err(ConnectError::Transport(e)) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    self.set_state(ConnectionState::Reconnecting);
                    attempt += 1;
                }
            }
        }
    }

    /// One connection epoch: drain outbound, dispatch inbound, heartbeat.
    async fn run_epoch(
        &self,
        framed: &mut FramedEnvelope<Box<dyn Duplex>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> EpochEnd {
        let start = tokio::time::Instant::now() + self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(start, self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut sent_seq: u64 = 0;
        let mut acked_seq: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return EpochEnd::Shutdown;
                    }
                }
                inbound = framed.next() => match inbound {
                    Some(Ok(envelope)) => {
                        eprintln!("DIAG epoch: inbound kind={:?}", envelope.kind);
                        if envelope.kind == MessageKind::HeartbeatAck {
                            if let Ok(ack) = envelope.decode::<HeartbeatAck>() {
                                acked_seq = acked_seq.max(ack.sequence);
                            }
                        }
                        self.shared.observers.dispatch(&envelope);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Stream error");
                        return EpochEnd::TransportLost;
                    }
                    None => {
                        info!("Service closed the connection");
                        return EpochEnd::TransportLost;
                    }
                },
                _ = ticker.tick() => {
                    let outstanding = sent_seq.saturating_sub(acked_seq);
                    if outstanding >= u64::from(self.config.heartbeat_miss_limit) {
                        warn!(outstanding, "Heartbeat acknowledgments missing");
                        return EpochEnd::TransportLost;
                    }
                    sent_seq += 1;
                    let heartbeat = Heartbeat {
                        runner_id: self.credentials.runner_id.clone(),
                        sequence: sent_seq,
                        active_jobs: self.shared.active_jobs.load(Ordering::Relaxed),
                        queue_depth: self.shared.queue.depth() as u64,
                    };
                    match Envelope::encode(Priority::CONTROL, &heartbeat) {
                        Ok(envelope) => self.shared.queue.push(envelope.epoch_local()),
                        Err(e) => error!(error = %e, "Failed to encode heartbeat"),
                    }
                }
                envelope = self.shared.queue.pop_wait() => {
                    eprintln!("DIAG epoch: sending envelope kind={:?}", envelope.kind);
                    if let Err(e) = framed.send(envelope.clone()).await {
                        warn!(error = %e, "Send failed; epoch over");
                        if !envelope.epoch_local {
                            self.shared.queue.requeue(envelope);
                        }
                        return EpochEnd::TransportLost;
                    }
                }
            }
        }
    }

    /// Best-effort drain of durable queued messages before closing.
    async fn flush(&self, framed: &mut FramedEnvelope<Box<dyn Duplex>>) {
        let drain = async {
            while let Some(envelope) = self.shared.queue.pop() {
                if envelope.epoch_local {
                    continue;
                }
                framed.send(envelope).await?;
            }
            framed.close().await
        };
        match tokio::time::timeout(Duration::from_secs(5), drain).await {
            Ok(Ok(())) => debug!("Outgoing queue flushed"),
            Ok(Err(e)) => warn!(error = %e, "Flush failed"),
            Err(_) => warn!("Flush timed out with messages still queued"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::memory::MemoryTransport;
    use gridrun_core::{JobId, JobStatus};
    use gridrun_proto::JobStatusUpdate;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_miss_limit: 2,
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(100),
                factor: 2.0,
                jitter: 0.0,
            },
            handshake_timeout: Duration::from_secs(5),
            queue_warn_depth: 1024,
            max_concurrent_jobs: 4,
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            runner_id: RunnerId::new("r-test"),
            token: "secret".into(),
        }
    }

    fn status_update(job: &str) -> Envelope {
        Envelope::encode(
            Priority::NORMAL,
            &JobStatusUpdate {
                job_id: JobId::new(job),
                status: JobStatus::Running,
                detail: None,
            },
        )
        .unwrap()
    }

    /// Queue a fresh duplex stream for the transport and return the service
    /// side, framed.
    fn new_epoch(feed: &mpsc::UnboundedSender<DuplexStream>) -> FramedEnvelope<DuplexStream> {
        let (client, service) = tokio::io::duplex(64 * 1024);
        feed.send(client).unwrap();
        frame(service)
    }

    /// Play the service side of the handshake: accept credentials and
    /// registration. Reconnect handshakes also carry a ready announcement.
    async fn accept_handshake(framed: &mut FramedEnvelope<DuplexStream>, expect_ready: bool) {
        let env = framed.next().await.unwrap().unwrap();
        assert_eq!(env.kind, MessageKind::CredentialValidate);
        framed
            .send(
                Envelope::encode(
                    Priority::CONTROL,
                    &CredentialResult {
                        accepted: true,
                        reason: None,
                    },
                )
                .unwrap(),
            )
            .await
            .unwrap();

        let env = framed.next().await.unwrap().unwrap();
        assert_eq!(env.kind, MessageKind::Register);
        framed
            .send(
                Envelope::encode(Priority::CONTROL, &RegisterResult { accepted: true }).unwrap(),
            )
            .await
            .unwrap();

        if expect_ready {
            let env = framed.next().await.unwrap().unwrap();
            assert_eq!(env.kind, MessageKind::Ready);
        }
    }

    async fn wait_for_state(handle: &ConnectionHandle, wanted: ConnectionState) {
        let mut states = handle.state_changes();
        while *states.borrow_and_update() != wanted {
            states.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_authenticates_and_delivers_sends() {
        let (transport, feed) = MemoryTransport::new();
        let mut service = new_epoch(&feed);
        let manager =
            ConnectionManager::new(Arc::new(transport), credentials(), test_config(), "host");

        let service_task = tokio::spawn(async move {
            accept_handshake(&mut service, false).await;
            service
        });
        let (handle, _join) = manager.start().await.unwrap();
        let mut service = service_task.await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Active);

        handle.send(status_update("j-1"));
        let env = service.next().await.unwrap().unwrap();
        assert_eq!(env.kind, MessageKind::JobStatusUpdate);
    }

    #[tokio::test]
    async fn test_rejected_credentials_surface_as_auth_error() {
        let (transport, feed) = MemoryTransport::new();
        let mut service = new_epoch(&feed);
        let manager =
            ConnectionManager::new(Arc::new(transport), credentials(), test_config(), "host");

        let service_task = tokio::spawn(async move {
            let env = service.next().await.unwrap().unwrap();
            assert_eq!(env.kind, MessageKind::CredentialValidate);
            service
                .send(
                    Envelope::encode(
                        Priority::CONTROL,
                        &CredentialResult {
                            accepted: false,
                            reason: Some("bad token".into()),
                        },
                    )
                    .unwrap(),
                )
                .await
                .unwrap();
            // Hold the stream open until the manager has reacted.
            service
        });

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, ConnectError::Auth(_)));
        drop(service_task);
    }

    #[tokio::test]
    async fn test_reconnect_redelivers_messages_queued_during_outage() {
        let (transport, feed) = MemoryTransport::new();
        let mut service = new_epoch(&feed);
        let manager =
            ConnectionManager::new(Arc::new(transport), credentials(), test_config(), "host");

        let service_task = tokio::spawn(async move {
            accept_handshake(&mut service, false).await;
            service
        });
        let (handle, _join) = manager.start().await.unwrap();
        let service = service_task.await.unwrap();

        // Kill the first epoch and queue a message while disconnected.
        drop(service);
        wait_for_state(&handle, ConnectionState::Reconnecting).await;
        handle.send(status_update("j-queued"));

        // Second epoch: the queued message must arrive after the handshake.
        let mut service = new_epoch(&feed);
        accept_handshake(&mut service, true).await;
        wait_for_state(&handle, ConnectionState::Active).await;

        let env = service.next().await.unwrap().unwrap();
        assert_eq!(env.kind, MessageKind::JobStatusUpdate);
        let update: JobStatusUpdate = env.decode().unwrap();
        assert_eq!(update.job_id, JobId::new("j-queued"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeat_acks_trigger_reconnect() {
        let (transport, feed) = MemoryTransport::new();
        let mut service = new_epoch(&feed);
        let manager =
            ConnectionManager::new(Arc::new(transport), credentials(), test_config(), "host");

        let service_task = tokio::spawn(async move {
            accept_handshake(&mut service, false).await;
            // Read heartbeats but never acknowledge them.
            let mut heartbeats = 0u32;
            while let Some(Ok(env)) = service.next().await {
                if env.kind == MessageKind::Heartbeat {
                    heartbeats += 1;
                }
            }
            heartbeats
        });
        let (handle, _join) = manager.start().await.unwrap();

        wait_for_state(&handle, ConnectionState::Reconnecting).await;
        let heartbeats = service_task.await.unwrap();
        assert!(heartbeats >= 2, "expected two unacked heartbeats, saw {heartbeats}");

        // A successful re-connect returns the manager to Active and resumes
        // the queue drain.
        let mut service = new_epoch(&feed);
        accept_handshake(&mut service, true).await;
        wait_for_state(&handle, ConnectionState::Active).await;

        handle.send(status_update("j-after"));
        let env = service.next().await.unwrap().unwrap();
        assert_eq!(env.kind, MessageKind::JobStatusUpdate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_heartbeats_keep_the_epoch_alive() {
        let (transport, feed) = MemoryTransport::new();
        let mut service = new_epoch(&feed);
        let manager =
            ConnectionManager::new(Arc::new(transport), credentials(), test_config(), "host");

        let service_task = tokio::spawn(async move {
            accept_handshake(&mut service, false).await;
            let mut acked = 0u32;
            while acked < 4 {
                let env = service.next().await.unwrap().unwrap();
                if env.kind != MessageKind::Heartbeat {
                    continue;
                }
                let hb: Heartbeat = env.decode().unwrap();
                service
                    .send(
                        Envelope::encode(
                            Priority::CONTROL,
                            &HeartbeatAck {
                                sequence: hb.sequence,
                            },
                        )
                        .unwrap(),
                    )
                    .await
                    .unwrap();
                acked += 1;
            }
            service
        });
        let (handle, _join) = manager.start().await.unwrap();

        let _service = service_task.await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Active);
    }
}
