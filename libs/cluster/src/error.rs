//! Error taxonomy for cluster operations.
//!
//! Transient infrastructure errors (submission, demand queries) are
//! recovered locally via retry or tick-skip; exhausted retries and
//! drain timeouts surface through the cluster's event stream.

use std::time::Duration;

use batchq_id::{JobId, WorkerName};
use thiserror::Error;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur while managing a cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The batch scheduler rejected a job submission.
    ///
    /// Retried with backoff by the controller; surfaced once retries
    /// are exhausted.
    #[error("batch scheduler rejected submission: {0}")]
    Submission(String),

    /// Submission retries were exhausted for a job.
    #[error("submission of {job_id} failed after {attempts} attempts: {message}")]
    SubmissionExhausted {
        job_id: JobId,
        attempts: u32,
        message: String,
    },

    /// Cancelling a job handle failed.
    ///
    /// Best-effort; the underlying job may still terminate on its own.
    #[error("cancellation failed: {0}")]
    Cancellation(String),

    /// A worker did not disconnect within the drain bound.
    ///
    /// The worker is force-removed from tracked state; the job may
    /// leak at the batch-scheduler level.
    #[error("worker {worker} did not disconnect within {timeout:?}")]
    DrainTimeout {
        worker: WorkerName,
        timeout: Duration,
    },

    /// Querying the demand oracle failed.
    ///
    /// Transient: the adaptive tick is skipped and the loop continues.
    #[error("demand query failed: {0}")]
    DemandQuery(String),

    /// The cluster did not reach plan == observed within the bound.
    #[error("cluster did not converge within {timeout:?}")]
    ConvergenceTimeout { timeout: Duration },

    /// The job template fails validation.
    #[error("invalid job template: {0}")]
    InvalidTemplate(String),

    /// A memory quantity string could not be parsed.
    #[error("invalid memory quantity '{0}'")]
    InvalidMemory(String),

    /// The cluster has been closed; no further scaling is accepted.
    #[error("cluster is closed")]
    Closed,
}

impl ClusterError {
    /// Returns true for errors the control loops recover from locally:
    /// submission rejections are retried with backoff, failed demand
    /// queries skip the tick. Everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Submission(_) | ClusterError::DemandQuery(_)
        )
    }
}
