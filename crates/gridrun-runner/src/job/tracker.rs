//! Bookkeeping for in-flight jobs.
//!
//! The tracker is owned by the job manager's task, which is its only writer;
//! jobs never touch it. It answers two questions: which jobs are live, and
//! how much capacity they have committed.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use gridrun_core::{JobId, ResourceClaim};

use super::job::JobControl;

/// The manager's handle onto one launched job. The job's state lives in its
/// own task; this is routing and accounting only.
pub struct JobHandle {
    pub resources: ResourceClaim,
    pub control: mpsc::Sender<JobControl>,
    pub task: JoinHandle<()>,
}

/// Set of launched, not-yet-finished jobs and their committed resources.
#[derive(Default)]
pub struct JobTracker {
    active: HashMap<JobId, JobHandle>,
    committed: ResourceClaim,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly launched job.
    pub fn insert(&mut self, id: JobId, handle: JobHandle) {
        self.committed = self.committed.plus(&handle.resources);
        self.active.insert(id, handle);
    }

    /// Stop tracking a finished (or detached) job, releasing its resources.
    pub fn remove(&mut self, id: &JobId) -> Option<JobHandle> {
        let handle = self.active.remove(id)?;
        self.committed = self.committed.minus(&handle.resources);
        Some(handle)
    }

    pub fn get(&self, id: &JobId) -> Option<&JobHandle> {
        self.active.get(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.active.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Resources committed by all in-flight jobs.
    pub fn committed(&self) -> &ResourceClaim {
        &self.committed
    }

    /// Take every handle, leaving the tracker empty. Shutdown enumeration.
    pub fn drain(&mut self) -> Vec<(JobId, JobHandle)> {
        self.committed = ResourceClaim::default();
        self.active.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(cores: u32) -> JobHandle {
        let (control, _rx) = mpsc::channel(1);
        JobHandle {
            resources: ResourceClaim::new(cores, 0),
            control,
            task: tokio::spawn(async {}),
        }
    }

    #[tokio::test]
    async fn test_committed_tracks_insert_and_remove() {
        let mut tracker = JobTracker::new();
        tracker.insert(JobId::new("a"), handle(2));
        tracker.insert(JobId::new("b"), handle(3));
        assert_eq!(tracker.committed().cores, 5);
        assert_eq!(tracker.active_count(), 2);

        tracker.remove(&JobId::new("a"));
        assert_eq!(tracker.committed().cores, 3);
        assert!(!tracker.contains(&JobId::new("a")));
        assert!(tracker.remove(&JobId::new("a")).is_none());
    }

    #[tokio::test]
    async fn test_drain_empties_and_resets() {
        let mut tracker = JobTracker::new();
        tracker.insert(JobId::new("a"), handle(2));
        tracker.insert(JobId::new("b"), handle(2));

        let drained = tracker.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.committed().cores, 0);
    }
}
