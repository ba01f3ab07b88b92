//! Job execution unit.
//!
//! Each admitted job runs as one independent task driving the lifecycle
//! `Pending -> FetchingResources -> Running -> Uploading -> Completed`, with
//! `Failed` and `Terminated` as terminal side-paths. The task is the sole
//! writer of its job's status; the job manager only routes control messages
//! in and observes the terminal notification.
//!
//! The subprocess is spawned in its own process group with `kill_on_drop`
//! disabled: a runner exit must never propagate a kill to a running
//! simulation. Detaching (runner shutdown) abandons the monitor and leaves a
//! marker file so a future runner can rediscover the orphan.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use gridrun_core::{FailureReason, JobId, JobOutcome, JobSpec, JobStatus, Priority};
use gridrun_proto::{Envelope, JobResultReport, JobStatusUpdate};

use crate::connection::ConnectionHandle;
use crate::storage::ArtifactStore;

/// Tunables for a job's lifecycle.
#[derive(Debug, Clone)]
pub struct JobPolicy {
    /// Input staging attempts before `Failed`.
    pub fetch_retries: u32,

    /// Result report attempts before `Failed`.
    pub upload_retries: u32,

    /// How long to wait for a result acknowledgment per attempt.
    pub result_ack_timeout: Duration,

    /// Delay between a graceful stop request and a forced kill.
    pub terminate_grace: Duration,

    /// Cadence of progress reports while running.
    pub progress_interval: Duration,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            fetch_retries: 3,
            upload_retries: 3,
            result_ack_timeout: Duration::from_secs(30),
            terminate_grace: Duration::from_secs(10),
            progress_interval: Duration::from_secs(30),
        }
    }
}

/// Control messages routed to a specific job.
#[derive(Debug)]
pub enum JobControl {
    /// Cooperative cancellation: graceful stop, forced kill after the grace
    /// timeout.
    Terminate { reason: String },

    /// The service acknowledged this job's result report.
    ResultAcked,

    /// Runner shutdown: stop monitoring but leave the subprocess running.
    Detach,
}

/// Terminal notification from a job task to the manager.
#[derive(Debug)]
pub struct JobFinished {
    pub job_id: JobId,
    pub status: JobStatus,
    /// The monitor was abandoned with the subprocess still running.
    pub detached: bool,
}

#[derive(Serialize)]
struct DetachMarker<'a> {
    job_id: &'a JobId,
    pid: Option<u32>,
    workdir: &'a PathBuf,
    detached_at: DateTime<Utc>,
}

enum FetchExit {
    Done,
    Failed,
    Terminated(String),
    Detached,
}

enum RunOutcome {
    Exited(std::process::ExitStatus),
    WaitFailed(std::io::Error),
    Terminated(String),
    Detached,
}

enum UploadExit {
    Acked,
    Failed(FailureReason),
    Terminated(String),
    Detached,
}

/// One admitted unit of work and the state machine driving it.
pub struct Job {
    spec: JobSpec,
    status: JobStatus,
    workdir: PathBuf,
    child: Option<Child>,
    pid: Option<u32>,
    exit_code: Option<i32>,
    connection: ConnectionHandle,
    store: Arc<dyn ArtifactStore>,
    policy: JobPolicy,
    control: mpsc::Receiver<JobControl>,
}

impl Job {
    pub fn new(
        spec: JobSpec,
        workdir: PathBuf,
        connection: ConnectionHandle,
        store: Arc<dyn ArtifactStore>,
        policy: JobPolicy,
        control: mpsc::Receiver<JobControl>,
    ) -> Self {
        Self {
            spec,
            status: JobStatus::Pending,
            workdir,
            child: None,
            pid: None,
            exit_code: None,
            connection,
            store,
            policy,
            control,
        }
    }

    /// Drive the job to a terminal state (or detach) and notify the manager.
    pub async fn run(mut self, finished: mpsc::UnboundedSender<JobFinished>) {
        let job_id = self.spec.id.clone();
        let detached = self.drive().await;
        let _ = finished.send(JobFinished {
            job_id,
            status: self.status,
            detached,
        });
    }

    async fn drive(&mut self) -> bool {
        self.transition(JobStatus::FetchingResources, None);
        match self.fetch_inputs().await {
            FetchExit::Done => {}
            FetchExit::Failed => {
                self.fail(FailureReason::ResourceError);
                return false;
            }
            FetchExit::Terminated(reason) => {
                self.transition(JobStatus::Terminated, Some(reason));
                return false;
            }
            FetchExit::Detached => {
                self.write_detach_marker();
                return true;
            }
        }

        let started = Instant::now();
        match self.spawn_subprocess() {
            Ok(child) => self.child = Some(child),
            Err(e) => {
                warn!(job_id = %self.spec.id, error = %e, "Failed to spawn subprocess");
                self.fail(FailureReason::LaunchError);
                return false;
            }
        }
        self.transition(JobStatus::Running, None);

        let outcome = self.monitor(started).await;
        match outcome {
            RunOutcome::Detached => {
                self.write_detach_marker();
                return true;
            }
            RunOutcome::Terminated(reason) => {
                self.child = None;
                self.transition(JobStatus::Terminated, Some(reason));
                return false;
            }
            RunOutcome::WaitFailed(e) => {
                self.child = None;
                warn!(job_id = %self.spec.id, error = %e, "Lost track of subprocess");
                self.fail(FailureReason::LaunchError);
                return false;
            }
            RunOutcome::Exited(status) => {
                self.child = None;
                self.exit_code = status.code();
                if !status.success() {
                    self.fail(FailureReason::NonZeroExit);
                    return false;
                }
            }
        }

        self.transition(JobStatus::Uploading, None);
        match self.upload_results().await {
            UploadExit::Acked => {
                self.transition(JobStatus::Completed, None);
                false
            }
            UploadExit::Failed(reason) => {
                self.fail(reason);
                false
            }
            UploadExit::Terminated(reason) => {
                self.transition(JobStatus::Terminated, Some(reason));
                false
            }
            UploadExit::Detached => {
                self.write_detach_marker();
                true
            }
        }
    }

    /// Stage every declared input, retrying a bounded number of times.
    async fn fetch_inputs(&mut self) -> FetchExit {
        if self.spec.inputs.is_empty() {
            return FetchExit::Done;
        }

        let store = self.store.clone();
        let spec = self.spec.clone();
        let workdir = self.workdir.clone();
        let mut attempt: u32 = 0;
        loop {
            let staging = stage_inputs(&store, &spec, &workdir);
            tokio::select! {
                result = staging => match result {
                    Ok(()) => return FetchExit::Done,
                    Err(e) => {
                        attempt += 1;
                        if attempt > self.policy.fetch_retries {
                            warn!(job_id = %spec.id, error = %e, "Input staging failed; retries exhausted");
                            return FetchExit::Failed;
                        }
                        warn!(job_id = %spec.id, attempt, error = %e, "Input staging failed; retrying");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                },
                ctrl = self.control.recv() => match ctrl {
                    Some(JobControl::Terminate { reason }) => return FetchExit::Terminated(reason),
                    Some(JobControl::Detach) | None => return FetchExit::Detached,
                    Some(JobControl::ResultAcked) => {}
                },
            }
        }
    }

    fn spawn_subprocess(&mut self) -> std::io::Result<Child> {
        let stdout = std::fs::File::create(self.workdir.join("job.out"))?;
        let stderr = std::fs::File::create(self.workdir.join("job.err"))?;

        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        self.pid = child.id();
        info!(job_id = %self.spec.id, pid = ?self.pid, "Subprocess started");
        Ok(child)
    }

    /// Watch the subprocess until it exits, is terminated, or the monitor is
    /// detached. Progress is reported on a fixed cadence.
    async fn monitor(&mut self, started: Instant) -> RunOutcome {
        let first = Instant::now() + self.policy.progress_interval;
        let mut progress = tokio::time::interval_at(first, self.policy.progress_interval);
        let grace = self.policy.terminate_grace;

        let Self {
            child,
            control,
            connection,
            spec,
            ..
        } = self;
        let Some(child) = child.as_mut() else {
            return RunOutcome::WaitFailed(std::io::Error::other("no subprocess handle"));
        };

        loop {
            tokio::select! {
                status = child.wait() => return match status {
                    Ok(status) => RunOutcome::Exited(status),
                    Err(e) => RunOutcome::WaitFailed(e),
                },
                ctrl = control.recv() => match ctrl {
                    Some(JobControl::Terminate { reason }) => {
                        stop_subprocess(child, grace).await;
                        return RunOutcome::Terminated(reason);
                    }
                    Some(JobControl::Detach) | None => return RunOutcome::Detached,
                    Some(JobControl::ResultAcked) => {}
                },
                _ = progress.tick() => {
                    let detail = format!("running for {}s", started.elapsed().as_secs());
                    send_status(connection, spec, JobStatus::Running, Some(detail));
                }
            }
        }
    }

    /// Upload declared outputs and report the result, waiting for the
    /// service's acknowledgment. The report is re-sent on timeout; the
    /// service must treat repeats as idempotent.
    async fn upload_results(&mut self) -> UploadExit {
        let mut artifacts = Vec::new();
        for output in &self.spec.outputs {
            let path = self.workdir.join(output);
            if !path.is_file() {
                warn!(job_id = %self.spec.id, output, "Declared output missing; skipping");
                continue;
            }
            match self.store.upload(&self.spec.id, &path).await {
                Ok(reference) => artifacts.push(reference),
                Err(e) => {
                    warn!(job_id = %self.spec.id, output, error = %e, "Artifact upload failed");
                    return UploadExit::Failed(FailureReason::UploadError);
                }
            }
        }

        let report = JobResultReport {
            outcome: JobOutcome::success(self.spec.id.clone(), self.exit_code.unwrap_or(0)),
            artifacts,
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match Envelope::encode(Priority::HIGH, &report) {
                Ok(envelope) => self.connection.send(envelope),
                Err(e) => {
                    error!(job_id = %self.spec.id, error = %e, "Failed to encode result report");
                    return UploadExit::Failed(FailureReason::UploadError);
                }
            }

            let deadline = tokio::time::sleep(self.policy.result_ack_timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    ctrl = self.control.recv() => match ctrl {
                        Some(JobControl::ResultAcked) => return UploadExit::Acked,
                        Some(JobControl::Terminate { reason }) => return UploadExit::Terminated(reason),
                        Some(JobControl::Detach) | None => return UploadExit::Detached,
                    },
                }
            }

            if attempt > self.policy.upload_retries {
                warn!(job_id = %self.spec.id, "Result never acknowledged; retries exhausted");
                return UploadExit::Failed(FailureReason::UploadError);
            }
            warn!(job_id = %self.spec.id, attempt, "No result acknowledgment; re-sending report");
        }
    }

    /// Move to `next` and emit exactly one status-change message.
    fn transition(&mut self, next: JobStatus, detail: Option<String>) {
        if !self.status.can_transition_to(next) {
            error!(
                job_id = %self.spec.id,
                from = %self.status,
                to = %next,
                "Illegal status transition; dropping"
            );
            return;
        }
        self.status = next;
        info!(job_id = %self.spec.id, status = %next, "Job status");
        send_status(&self.connection, &self.spec, next, detail);
    }

    fn fail(&mut self, reason: FailureReason) {
        self.transition(JobStatus::Failed, Some(reason.to_string()));
    }

    fn write_detach_marker(&self) {
        let marker = DetachMarker {
            job_id: &self.spec.id,
            pid: self.pid,
            workdir: &self.workdir,
            detached_at: Utc::now(),
        };
        let path = self.workdir.join("detached.json");
        let written = serde_json::to_string_pretty(&marker)
            .map_err(std::io::Error::other)
            .and_then(|data| std::fs::write(&path, data));
        match written {
            Ok(()) => info!(job_id = %self.spec.id, pid = ?self.pid, "Detached from subprocess"),
            Err(e) => error!(job_id = %self.spec.id, error = %e, "Failed to write detach marker"),
        }
    }
}

async fn stage_inputs(
    store: &Arc<dyn ArtifactStore>,
    spec: &JobSpec,
    workdir: &PathBuf,
) -> Result<(), crate::storage::StoreError> {
    for reference in &spec.inputs {
        store.fetch(reference, workdir).await?;
    }
    Ok(())
}

fn send_status(
    connection: &ConnectionHandle,
    spec: &JobSpec,
    status: JobStatus,
    detail: Option<String>,
) {
    let priority = if status.is_terminal() {
        Priority::HIGH
    } else {
        Priority::NORMAL
    };
    let update = JobStatusUpdate {
        job_id: spec.id.clone(),
        status,
        detail,
    };
    match Envelope::encode(priority, &update) {
        Ok(envelope) => connection.send(envelope),
        Err(e) => error!(job_id = %spec.id, error = %e, "Failed to encode status update"),
    }
}

/// Graceful stop, then a forced kill once the grace period expires.
async fn stop_subprocess(child: &mut Child, grace: Duration) {
    request_stop(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("Grace period expired; killing subprocess");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill subprocess");
            }
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &Child) {
    if let Some(pid) = child.id() {
        // SIGTERM to the job's process group so helper processes stop too.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_stop(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::memory::MemoryTransport;
    use crate::connection::{ConnectionConfig, ConnectionManager, Credentials};
    use crate::storage::LocalStore;
    use gridrun_core::RunnerId;

    fn dead_connection() -> ConnectionHandle {
        let (transport, _feed) = MemoryTransport::new();
        ConnectionManager::new(
            Arc::new(transport),
            Credentials {
                runner_id: RunnerId::new("r-test"),
                token: String::new(),
            },
            ConnectionConfig::default(),
            "test-host",
        )
        .handle()
    }

    fn fast_policy() -> JobPolicy {
        JobPolicy {
            fetch_retries: 1,
            upload_retries: 1,
            result_ack_timeout: Duration::from_millis(200),
            terminate_grace: Duration::from_secs(5),
            progress_interval: Duration::from_secs(60),
        }
    }

    struct Harness {
        control: mpsc::Sender<JobControl>,
        finished: mpsc::UnboundedReceiver<JobFinished>,
        workdir: PathBuf,
        _tmp: tempfile::TempDir,
    }

    fn launch(spec: JobSpec, policy: JobPolicy) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = tmp.path().join("job");
        std::fs::create_dir_all(&workdir).unwrap();
        let store = Arc::new(LocalStore::new(
            tmp.path().join("jobs"),
            tmp.path().join("mirror"),
        ));
        let (control_tx, control_rx) = mpsc::channel(8);
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let job = Job::new(
            spec,
            workdir.clone(),
            dead_connection(),
            store,
            policy,
            control_rx,
        );
        tokio::spawn(job.run(finished_tx));
        Harness {
            control: control_tx,
            finished: finished_rx,
            workdir,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_the_job() {
        let spec = JobSpec::new("sh").with_arg("-c").with_arg("exit 3");
        let mut harness = launch(spec, fast_policy());
        let finished = harness.finished.recv().await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert!(!finished.detached);
    }

    #[tokio::test]
    async fn test_spawn_failure_fails_the_job() {
        let spec = JobSpec::new("definitely-not-a-real-binary-gridrun");
        let mut harness = launch(spec, fast_policy());
        let finished = harness.finished.recv().await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_input_fails_after_retries() {
        let spec = JobSpec::new("sh")
            .with_arg("-c")
            .with_arg("exit 0")
            .with_input("inputs/absent.dat");
        let mut policy = fast_policy();
        policy.fetch_retries = 0;
        let mut harness = launch(spec, policy);
        let finished = harness.finished.recv().await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_terminate_stops_a_running_job() {
        let spec = JobSpec::new("sh").with_arg("-c").with_arg("sleep 30");
        let mut harness = launch(spec, fast_policy());

        tokio::time::sleep(Duration::from_millis(300)).await;
        harness
            .control
            .send(JobControl::Terminate {
                reason: "operator request".into(),
            })
            .await
            .unwrap();

        let finished = harness.finished.recv().await.unwrap();
        assert_eq!(finished.status, JobStatus::Terminated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detach_abandons_the_monitor_but_not_the_subprocess() {
        let spec = JobSpec::new("sh").with_arg("-c").with_arg("sleep 30");
        let mut harness = launch(spec, fast_policy());

        tokio::time::sleep(Duration::from_millis(300)).await;
        harness.control.send(JobControl::Detach).await.unwrap();

        let finished = harness.finished.recv().await.unwrap();
        assert!(finished.detached);
        assert!(!finished.status.is_terminal());

        let marker_path = harness.workdir.join("detached.json");
        let marker: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&marker_path).unwrap()).unwrap();
        let pid = marker["pid"].as_u64().unwrap() as i32;

        // The subprocess must have outlived its monitor.
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(alive, "subprocess was killed on detach");

        // Don't leak the orphan beyond the test.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }

    #[tokio::test]
    async fn test_unacknowledged_result_fails_after_retries() {
        let tmp_spec = JobSpec::new("sh").with_arg("-c").with_arg("exit 0");
        let mut harness = launch(tmp_spec, fast_policy());
        // Nobody ever acknowledges the report; the job must give up.
        let finished = harness.finished.recv().await.unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
    }
}
