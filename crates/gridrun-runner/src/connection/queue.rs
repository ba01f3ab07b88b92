//! Outgoing message queue.
//!
//! A thread-safe priority queue of envelopes. Lower priority value drains
//! first; within a tier, insertion order is preserved. Requeued envelopes
//! (retries after a dropped connection epoch) go to the front of their tier
//! so they drain before traffic enqueued during the outage.

use gridrun_proto::Envelope;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use tokio::sync::Notify;

struct Queued {
    envelope: Envelope,
    seq: i64,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap is a max-heap; invert so the smallest (priority, seq) pops
    // first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.envelope.priority, other.seq).cmp(&(self.envelope.priority, self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<Queued>,
    next_back: i64,
    next_front: i64,
}

/// Priority queue for outgoing envelopes, shared between callers of `send`
/// and the drain loop.
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_back: 0,
                next_front: -1,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue an envelope. Never blocks.
    pub fn push(&self, envelope: Envelope) {
        {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.next_back;
            inner.next_back += 1;
            inner.heap.push(Queued { envelope, seq });
        }
        self.notify.notify_one();
    }

    /// Re-enqueue an envelope at the front of its priority tier. Used when a
    /// connection epoch ends with the envelope unsent.
    pub fn requeue(&self, envelope: Envelope) {
        {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.next_front;
            inner.next_front -= 1;
            inner.heap.push(Queued { envelope, seq });
        }
        self.notify.notify_one();
    }

    /// Remove and return the most urgent envelope, if any.
    pub fn pop(&self) -> Option<Envelope> {
        self.inner.lock().unwrap().heap.pop().map(|q| q.envelope)
    }

    /// Remove and return the most urgent envelope, suspending until one is
    /// available.
    pub async fn pop_wait(&self) -> Envelope {
        loop {
            if let Some(envelope) = self.pop() {
                return envelope;
            }
            self.notify.notified().await;
        }
    }

    /// Current queue depth.
    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    /// Drop every queued envelope marked epoch-local. Called when an epoch
    /// ends so stale heartbeats are not carried into the next connection.
    pub fn drop_epoch_local(&self) {
        let mut inner = self.inner.lock().unwrap();
        let kept: Vec<Queued> = inner
            .heap
            .drain()
            .filter(|q| !q.envelope.epoch_local)
            .collect();
        inner.heap.extend(kept);
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrun_core::{Priority, RunnerId};
    use gridrun_proto::{Envelope, Heartbeat, JobAccept};

    fn envelope(priority: Priority, tag: &str) -> Envelope {
        Envelope::encode(
            priority,
            &JobAccept {
                job_id: tag.into(),
            },
        )
        .unwrap()
    }

    fn tag(env: &Envelope) -> String {
        env.decode::<JobAccept>().unwrap().job_id.into_inner()
    }

    #[test]
    fn test_priority_order() {
        let queue = OutboundQueue::new();
        queue.push(envelope(Priority::LOW, "low"));
        queue.push(envelope(Priority::CONTROL, "control"));
        queue.push(envelope(Priority::NORMAL, "normal"));

        assert_eq!(tag(&queue.pop().unwrap()), "control");
        assert_eq!(tag(&queue.pop().unwrap()), "normal");
        assert_eq!(tag(&queue.pop().unwrap()), "low");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_within_tier() {
        let queue = OutboundQueue::new();
        for i in 0..5 {
            queue.push(envelope(Priority::NORMAL, &format!("m{i}")));
        }
        for i in 0..5 {
            assert_eq!(tag(&queue.pop().unwrap()), format!("m{i}"));
        }
    }

    #[test]
    fn test_requeue_goes_before_fresh_traffic() {
        let queue = OutboundQueue::new();
        queue.push(envelope(Priority::NORMAL, "first"));
        queue.push(envelope(Priority::NORMAL, "second"));

        let popped = queue.pop().unwrap();
        assert_eq!(tag(&popped), "first");
        queue.requeue(popped);

        assert_eq!(tag(&queue.pop().unwrap()), "first");
        assert_eq!(tag(&queue.pop().unwrap()), "second");
    }

    #[test]
    fn test_drop_epoch_local_keeps_durable_messages() {
        let queue = OutboundQueue::new();
        let hb = Envelope::encode(
            Priority::CONTROL,
            &Heartbeat {
                runner_id: RunnerId::new("r"),
                sequence: 1,
                active_jobs: 0,
                queue_depth: 0,
            },
        )
        .unwrap()
        .epoch_local();
        queue.push(hb);
        queue.push(envelope(Priority::NORMAL, "durable"));

        queue.drop_epoch_local();
        assert_eq!(queue.depth(), 1);
        assert_eq!(tag(&queue.pop().unwrap()), "durable");
    }

    #[tokio::test]
    async fn test_pop_wait_wakes_on_push() {
        let queue = std::sync::Arc::new(OutboundQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_wait().await })
        };
        tokio::task::yield_now().await;
        queue.push(envelope(Priority::NORMAL, "wake"));
        let env = waiter.await.unwrap();
        assert_eq!(tag(&env), "wake");
    }
}
