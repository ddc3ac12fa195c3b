//! Job specifications and worker lifecycle records.
//!
//! A `JobTemplate` describes the shape of every job a cluster submits;
//! the controller stamps a fresh `JobId` onto it at submission time to
//! produce an immutable `JobSpec`. Each spec owns `processes` worker
//! names, tracked individually as `WorkerRecord`s.

use std::time::{Duration, Instant};

use batchq_id::{JobId, WorkerName};
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::resources::ResourceRequest;

/// The shape of every job a cluster submits: per-process resources,
/// multiplicity, and the worker name prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    /// Resources for a single worker process.
    pub resources: ResourceRequest,

    /// Worker processes produced by one job. Must be ≥ 1.
    pub processes: u32,

    /// Prefix for derived worker names.
    pub name_prefix: String,
}

impl JobTemplate {
    /// Creates a template with multiplicity 1.
    #[must_use]
    pub fn new(name_prefix: impl Into<String>, resources: ResourceRequest) -> Self {
        Self {
            resources,
            processes: 1,
            name_prefix: name_prefix.into(),
        }
    }

    /// Sets the number of worker processes per job.
    #[must_use]
    pub fn with_processes(mut self, processes: u32) -> Self {
        self.processes = processes;
        self
    }

    /// Validates the template before the first submission.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.processes < 1 {
            return Err(ClusterError::InvalidTemplate(
                "processes must be at least 1".to_string(),
            ));
        }
        if self.resources.cores == 0 {
            return Err(ClusterError::InvalidTemplate(
                "cores per process must be non-zero".to_string(),
            ));
        }
        if self.name_prefix.is_empty() || self.name_prefix.chars().any(|c| c.is_whitespace()) {
            return Err(ClusterError::InvalidTemplate(
                "name prefix must be non-empty and free of whitespace".to_string(),
            ));
        }
        Ok(())
    }

    /// Stamps a fresh job id onto the template.
    #[must_use]
    pub fn stamp(&self) -> JobSpec {
        JobSpec {
            id: JobId::new(),
            resources: self.resources,
            processes: self.processes,
            name_prefix: self.name_prefix.clone(),
        }
    }
}

/// A single batch-scheduler submission. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Identifier of this submission.
    pub id: JobId,

    /// Resources for each worker process of the job.
    pub resources: ResourceRequest,

    /// Worker processes this job produces.
    pub processes: u32,

    /// Prefix for derived worker names.
    pub name_prefix: String,
}

impl JobSpec {
    /// Names of the worker processes this job produces.
    #[must_use]
    pub fn worker_names(&self) -> Vec<WorkerName> {
        (0..self.processes)
            .map(|i| WorkerName::for_process(&self.name_prefix, self.id, i))
            .collect()
    }

    /// Total cores requested by the job across all processes.
    #[must_use]
    pub fn total_cores(&self) -> u32 {
        self.resources.cores * self.processes
    }

    /// Total memory requested by the job across all processes, in bytes.
    #[must_use]
    pub fn total_memory_bytes(&self) -> u64 {
        self.resources.memory_bytes * u64::from(self.processes)
    }
}

/// Lifecycle status of a single worker process.
///
/// Transitions are monotonic; the only legal moves are
/// pending → running, pending → closing (retired before it ever
/// connected), running → closing, and closing → closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Submitted; not yet reported connected by the compute scheduler.
    Pending,

    /// Reported connected by the compute scheduler.
    Running,

    /// Targeted for removal; waiting for disconnection.
    Closing,

    /// Disconnection confirmed (or drain timed out).
    Closed,
}

impl WorkerStatus {
    /// Whether `next` is a legal transition from this status.
    #[must_use]
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Closing) | (Running, Closing) | (Closing, Closed)
        )
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Running => "running",
            WorkerStatus::Closing => "closing",
            WorkerStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Tracks a single worker process's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Globally unique worker name; join key with oracle-reported workers.
    pub name: WorkerName,

    /// The job that owns this worker.
    pub job_id: JobId,

    /// Current lifecycle status.
    pub status: WorkerStatus,

    /// When the record entered `Closing`, for drain deadline tracking.
    #[serde(skip)]
    closing_since: Option<Instant>,
}

impl WorkerRecord {
    /// Creates a pending record for a freshly submitted job.
    #[must_use]
    pub fn pending(name: WorkerName, job_id: JobId) -> Self {
        Self {
            name,
            job_id,
            status: WorkerStatus::Pending,
            closing_since: None,
        }
    }

    /// Advances the record to `next`, refusing skips and reversals.
    ///
    /// On rejection the record is unchanged and the illegal pair is
    /// returned for logging.
    pub fn advance(&mut self, next: WorkerStatus) -> Result<(), (WorkerStatus, WorkerStatus)> {
        if !self.status.can_transition_to(next) {
            return Err((self.status, next));
        }
        if next == WorkerStatus::Closing {
            self.closing_since = Some(Instant::now());
        }
        self.status = next;
        Ok(())
    }

    /// Time spent in `Closing`, if the record is draining.
    #[must_use]
    pub fn closing_elapsed(&self) -> Option<Duration> {
        self.closing_since.map(|t| t.elapsed())
    }

    /// Whether this worker counts toward the connected population.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.status, WorkerStatus::Pending | WorkerStatus::Running)
    }
}
