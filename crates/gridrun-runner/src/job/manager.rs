//! Job manager: admission control, queueing and orchestration.
//!
//! The manager is the sole writer of the job set. Inbound job-control
//! messages are routed to it through observer registrations that forward
//! into an event channel, so observer callbacks never do real work on the
//! dispatch path. Admission compares an offer's declared resources against
//! the last-known capability snapshot minus what in-flight jobs have
//! committed; accepted offers wait in a priority queue and launch strictly
//! in priority order as capacity frees up.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use gridrun_core::{CapabilitySnapshot, JobId, JobSpec, JobStatus, Priority, RunnerId};
use gridrun_proto::{
    CapabilityPush, Envelope, JobAccept, JobOffer, JobReject, JobResultAck, JobStatusUpdate,
    JobTerminate, MessageKind, Ready,
};

use crate::capability::{self, CapabilityProbe};
use crate::connection::ConnectionHandle;
use crate::storage::ArtifactStore;

use super::job::{Job, JobControl, JobFinished, JobPolicy};
use super::tracker::{JobHandle, JobTracker};

const OBSERVER_NAME: &str = "job-manager";

/// Orchestration tunables.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Jobs executing concurrently at most.
    pub max_concurrent_jobs: u32,

    /// Cadence of capability re-collection.
    pub capability_poll_interval: Duration,

    /// Age past which stale job directories are removed at startup.
    pub job_dir_max_age: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            capability_poll_interval: Duration::from_secs(300),
            job_dir_max_age: Duration::from_secs(7 * 86_400),
        }
    }
}

/// Wire events routed to the manager by its observer registrations.
enum ManagerEvent {
    Offer(JobSpec),
    Terminate { job_id: JobId, reason: String },
    ResultAck { job_id: JobId },
}

struct PendingJob {
    spec: JobSpec,
    seq: u64,
}

impl PartialEq for PendingJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingJob {}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingJob {
    // Max-heap inversion: most urgent (lowest priority value, oldest) first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.spec.priority, other.seq).cmp(&(self.spec.priority, self.seq))
    }
}

/// The orchestrator owning the runner's job set.
pub struct JobManager {
    connection: ConnectionHandle,
    probe: Arc<dyn CapabilityProbe>,
    store: Arc<dyn ArtifactStore>,
    runner_id: RunnerId,
    policy: JobPolicy,
    config: ManagerConfig,
    capability_cache: PathBuf,

    snapshot: CapabilitySnapshot,
    pending: BinaryHeap<PendingJob>,
    pending_seq: u64,
    tracker: JobTracker,
    launch_retried: HashSet<JobId>,

    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    events_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    finished_tx: mpsc::UnboundedSender<JobFinished>,
    finished_rx: mpsc::UnboundedReceiver<JobFinished>,
}

impl JobManager {
    pub fn new(
        connection: ConnectionHandle,
        probe: Arc<dyn CapabilityProbe>,
        store: Arc<dyn ArtifactStore>,
        runner_id: RunnerId,
        policy: JobPolicy,
        config: ManagerConfig,
        capability_cache: PathBuf,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            connection,
            probe,
            store,
            runner_id,
            policy,
            config,
            capability_cache,
            snapshot: CapabilitySnapshot::default(),
            pending: BinaryHeap::new(),
            pending_seq: 0,
            tracker: JobTracker::new(),
            launch_retried: HashSet::new(),
            events_tx,
            events_rx,
            finished_tx,
            finished_rx,
        }
    }

    /// Steady-state loop. Runs the startup sequence (capability reconcile,
    /// observer registration, ready announcement) and then processes events
    /// until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.startup().await;

        let first = tokio::time::Instant::now() + self.config.capability_poll_interval;
        let mut capability_ticker =
            tokio::time::interval_at(first, self.config.capability_poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = capability_ticker.tick() => {
                    let previous = self.snapshot.clone();
                    self.refresh_capability(Some(previous));
                }
                event = self.events_rx.recv() => {
                    eprintln!("DIAG loop: got event={}", event.is_some());
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
                finished = self.finished_rx.recv() => {
                    if let Some(finished) = finished {
                        self.handle_finished(finished);
                    }
                }
            }

            self.launch_ready_jobs().await;
            self.connection
                .set_active_jobs(self.tracker.active_count() as u32);
        }

        self.shutdown().await;
    }

    async fn startup(&mut self) {
        eprintln!("DIAG startup: begin");
        let cached = capability::read_cached(&self.capability_cache);
        self.refresh_capability(cached);
        eprintln!("DIAG startup: refresh_capability done");

        if let Err(e) = self.store.cleanup_aged(self.config.job_dir_max_age).await {
            warn!(error = %e, "Job directory cleanup failed");
        }
        eprintln!("DIAG startup: cleanup_aged done");

        self.register_observers();
        self.announce_ready();
        eprintln!("DIAG startup: announce_ready done");
        info!(runner_id = %self.runner_id, "Job manager ready for offers");
    }

    /// Reconcile against `previous` (the cache at startup, the held snapshot
    /// on the polling cadence); push upstream and refresh the cache when the
    /// host changed.
    fn refresh_capability(&mut self, previous: Option<CapabilitySnapshot>) {
        let current = match &previous {
            Some(prev) => self.probe.detect_change(prev),
            None => Some(self.probe.collect()),
        };
        let Some(current) = current else {
            debug!("No change to capability snapshot");
            if let Some(prev) = previous {
                self.snapshot = prev;
            }
            return;
        };

        info!("Capability snapshot changed; pushing upstream");
        let push = CapabilityPush {
            runner_id: self.runner_id.clone(),
            snapshot: current.clone(),
        };
        match Envelope::encode(Priority::CONTROL, &push) {
            Ok(envelope) => self.connection.send(envelope),
            Err(e) => error!(error = %e, "Failed to encode capability push"),
        }
        if let Err(e) = capability::write_cache(&self.capability_cache, &current) {
            warn!(error = %e, "Failed to write capability cache");
        }
        self.snapshot = current;
    }

    fn register_observers(&self) {
        let tx = self.events_tx.clone();
        self.connection.register_observer(
            MessageKind::JobOffer,
            OBSERVER_NAME,
            Arc::new(move |envelope| match envelope.decode::<JobOffer>() {
                Ok(offer) => {
                    eprintln!("DIAG observer: decoded JobOffer, sending event");
                    let _ = tx.send(ManagerEvent::Offer(offer.spec));
                }
                Err(e) => { eprintln!("DIAG observer: UNDECODABLE JobOffer: {e}"); warn!(error = %e, "Undecodable job offer"); }
            }),
        );

        let tx = self.events_tx.clone();
        self.connection.register_observer(
            MessageKind::JobTerminate,
            OBSERVER_NAME,
            Arc::new(move |envelope| match envelope.decode::<JobTerminate>() {
                Ok(request) => {
                    let _ = tx.send(ManagerEvent::Terminate {
                        job_id: request.job_id,
                        reason: request.reason,
                    });
                }
                Err(e) => warn!(error = %e, "Undecodable termination request"),
            }),
        );

        let tx = self.events_tx.clone();
        self.connection.register_observer(
            MessageKind::JobResultAck,
            OBSERVER_NAME,
            Arc::new(move |envelope| match envelope.decode::<JobResultAck>() {
                Ok(ack) => {
                    let _ = tx.send(ManagerEvent::ResultAck { job_id: ack.job_id });
                }
                Err(e) => warn!(error = %e, "Undecodable result acknowledgment"),
            }),
        );
    }

    fn announce_ready(&self) {
        let ready = Ready {
            runner_id: self.runner_id.clone(),
            free_slots: self
                .config
                .max_concurrent_jobs
                .saturating_sub(self.tracker.active_count() as u32),
        };
        match Envelope::encode(Priority::CONTROL, &ready) {
            Ok(envelope) => self.connection.send(envelope),
            Err(e) => error!(error = %e, "Failed to encode ready announcement"),
        }
    }

    fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Offer(spec) => self.handle_offer(spec),
            ManagerEvent::Terminate { job_id, reason } => self.handle_terminate(job_id, reason),
            ManagerEvent::ResultAck { job_id } => {
                if let Some(handle) = self.tracker.get(&job_id) {
                    if handle.control.try_send(JobControl::ResultAcked).is_err() {
                        warn!(%job_id, "Could not route result acknowledgment");
                    }
                } else {
                    // Duplicate ack after completion; at-least-once delivery
                    // makes these routine.
                    debug!(%job_id, "Acknowledgment for unknown job");
                }
            }
        }
    }

    /// Admission decision. Accept creates no execution state beyond a queue
    /// entry; reject creates nothing at all.
    fn handle_offer(&mut self, spec: JobSpec) {
        let job_id = spec.id.clone();
        eprintln!("DIAG handle_offer: job={} cores={} admits={}", job_id, spec.resources.cores, self.snapshot.admits(self.tracker.committed(), &spec.resources));

        // Re-offered jobs (at-least-once delivery) are re-acknowledged
        // without creating a second execution unit.
        if self.tracker.contains(&job_id) || self.pending.iter().any(|p| p.spec.id == job_id) {
            debug!(%job_id, "Duplicate offer; re-acknowledging");
            self.send_accept(&job_id);
            return;
        }

        if !self
            .snapshot
            .admits(self.tracker.committed(), &spec.resources)
        {
            info!(
                %job_id,
                cores = spec.resources.cores,
                memory = spec.resources.memory_bytes,
                "Rejecting offer; insufficient capacity"
            );
            let reject = JobReject {
                job_id,
                reason: "insufficient capacity".into(),
            };
            match Envelope::encode(Priority::HIGH, &reject) {
                Ok(envelope) => self.connection.send(envelope),
                Err(e) => error!(error = %e, "Failed to encode rejection"),
            }
            return;
        }

        info!(%job_id, priority = %spec.priority, "Accepted job offer");
        self.send_accept(&job_id);
        self.pending_seq += 1;
        self.pending.push(PendingJob {
            spec,
            seq: self.pending_seq,
        });
    }

    fn send_accept(&self, job_id: &JobId) {
        let accept = JobAccept {
            job_id: job_id.clone(),
        };
        match Envelope::encode(Priority::HIGH, &accept) {
            Ok(envelope) => self.connection.send(envelope),
            Err(e) => error!(error = %e, "Failed to encode acceptance"),
        }
    }

    fn handle_terminate(&mut self, job_id: JobId, reason: String) {
        if let Some(handle) = self.tracker.get(&job_id) {
            info!(%job_id, %reason, "Routing termination to running job");
            if handle
                .control
                .try_send(JobControl::Terminate { reason })
                .is_err()
            {
                warn!(%job_id, "Could not route termination request");
            }
        } else if let Some(spec) = self.remove_pending(&job_id) {
            // Never launched; the manager reports the terminal state itself.
            info!(job_id = %spec.id, %reason, "Terminated queued job");
            self.send_status(&job_id, JobStatus::Terminated, Some(reason));
        } else {
            warn!(%job_id, "Termination request for unknown job");
        }
    }

    fn remove_pending(&mut self, job_id: &JobId) -> Option<JobSpec> {
        if !self.pending.iter().any(|p| p.spec.id == *job_id) {
            return None;
        }
        let mut entries = std::mem::take(&mut self.pending).into_vec();
        let index = entries.iter().position(|p| p.spec.id == *job_id)?;
        let removed = entries.swap_remove(index);
        self.pending = BinaryHeap::from(entries);
        Some(removed.spec)
    }

    fn handle_finished(&mut self, finished: JobFinished) {
        if self.tracker.remove(&finished.job_id).is_some() {
            info!(
                job_id = %finished.job_id,
                status = %finished.status,
                detached = finished.detached,
                "Job finished"
            );
        }
        self.launch_retried.remove(&finished.job_id);
    }

    /// Launch queued jobs strictly in priority order while slots and
    /// resources allow. A most-urgent job that does not currently fit blocks
    /// the queue rather than being skipped.
    async fn launch_ready_jobs(&mut self) {
        while (self.tracker.active_count() as u32) < self.config.max_concurrent_jobs {
            let fits = match self.pending.peek() {
                Some(next) => self
                    .snapshot
                    .admits(self.tracker.committed(), &next.spec.resources),
                None => return,
            };
            if !fits {
                return;
            }
            let Some(entry) = self.pending.pop() else {
                return;
            };
            self.launch(entry.spec).await;
        }
    }

    async fn launch(&mut self, spec: JobSpec) {
        let job_id = spec.id.clone();
        let workdir = match self.store.create_job_dir(&job_id).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(%job_id, error = %e, "Failed to prepare job directory");
                if self.launch_retried.insert(job_id.clone()) {
                    // One re-queue; a second failure is terminal.
                    self.pending_seq += 1;
                    self.pending.push(PendingJob {
                        spec,
                        seq: self.pending_seq,
                    });
                } else {
                    error!(%job_id, "Job directory unavailable; failing job");
                    self.send_status(
                        &job_id,
                        JobStatus::Failed,
                        Some("launch error".to_string()),
                    );
                }
                return;
            }
        };

        let (control_tx, control_rx) = mpsc::channel(8);
        let job = Job::new(
            spec.clone(),
            workdir,
            self.connection.clone(),
            self.store.clone(),
            self.policy.clone(),
            control_rx,
        );
        let task = tokio::spawn(job.run(self.finished_tx.clone()));
        self.tracker.insert(
            job_id.clone(),
            JobHandle {
                resources: spec.resources,
                control: control_tx,
                task,
            },
        );
        info!(%job_id, active = self.tracker.active_count(), "Launched job");
    }

    fn send_status(&self, job_id: &JobId, status: JobStatus, detail: Option<String>) {
        let update = JobStatusUpdate {
            job_id: job_id.clone(),
            status,
            detail,
        };
        match Envelope::encode(Priority::HIGH, &update) {
            Ok(envelope) => self.connection.send(envelope),
            Err(e) => error!(error = %e, "Failed to encode status update"),
        }
    }

    /// Detaching shutdown: stop admitting offers, tell every in-flight job to
    /// abandon its monitor without killing the subprocess, and give the
    /// monitors a short window to write their markers.
    async fn shutdown(&mut self) {
        info!("Job manager shutting down");
        self.connection
            .unregister_observer(MessageKind::JobOffer, OBSERVER_NAME);

        let mut tasks = Vec::new();
        for (job_id, handle) in self.tracker.drain() {
            if handle.control.try_send(JobControl::Detach).is_err() {
                warn!(%job_id, "Could not signal detach");
            }
            tasks.push(handle.task);
        }

        let monitors = futures::future::join_all(tasks);
        if tokio::time::timeout(Duration::from_secs(5), monitors)
            .await
            .is_err()
        {
            warn!("Abandoning job monitors still running at shutdown");
        }

        self.connection
            .unregister_observer(MessageKind::JobTerminate, OBSERVER_NAME);
        self.connection
            .unregister_observer(MessageKind::JobResultAck, OBSERVER_NAME);
    }
}
