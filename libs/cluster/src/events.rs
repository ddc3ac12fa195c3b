//! Cluster state-change and failure notifications.
//!
//! Events are immutable records of transitions the caller cannot see
//! in the snapshot accessors alone: exhausted submission retries,
//! drain timeouts, unknown workers. They are published on a broadcast
//! bus; slow or absent subscribers never block the control loop.

use batchq_id::{JobId, WorkerName};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the broadcast bus; older events are dropped for lagging
/// subscribers.
const EVENT_BUS_CAPACITY: usize = 256;

/// A timestamped cluster event.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterEvent {
    /// When the event was published.
    pub at: DateTime<Utc>,

    /// What happened.
    #[serde(flatten)]
    pub kind: ClusterEventKind,
}

/// Kinds of cluster events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEventKind {
    /// The desired worker count changed.
    Scaled { target: u32 },

    /// A job was accepted by the batch scheduler.
    JobSubmitted { job_id: JobId },

    /// Submission retries were exhausted for a job.
    SubmissionFailed {
        job_id: JobId,
        attempts: u32,
        message: String,
    },

    /// A job's handle was cancelled.
    JobCancelled { job_id: JobId },

    /// Cancelling a job's handle failed; the drain timeout still
    /// bounds the worker's removal.
    CancellationFailed { job_id: JobId, message: String },

    /// A closing worker did not disconnect within the drain bound and
    /// was force-removed. The job may leak at the batch scheduler.
    DrainTimedOut { worker: WorkerName, job_id: JobId },

    /// The oracle reported a worker no requested job accounts for.
    /// Ignored, never adopted.
    UnknownWorkerObserved { worker: WorkerName },

    /// The cluster finished closing.
    Closed,
}

/// In-process broadcast bus for cluster events.
#[derive(Debug)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes an event; a send error only means nobody subscribed.
    pub(crate) fn publish(&self, kind: ClusterEventKind) {
        let _ = self.tx.send(ClusterEvent {
            at: Utc::now(),
            kind,
        });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }
}
