//! The seam to the external batch scheduler.
//!
//! Implementations own everything scheduler-specific: submission
//! script templating, queue directives, flag dialects. The controller
//! only ever submits specs and cancels handles, so it is generic over
//! any batch system that can do those two things.

use async_trait::async_trait;

use crate::error::ClusterError;
use crate::spec::JobSpec;

/// Opaque identifier for a submitted job, owned by the launcher.
///
/// The controller holds the handle for the job's lifetime and passes
/// it back to request cancellation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    /// Wraps a launcher-issued token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Submits jobs to and cancels jobs on the external batch scheduler.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Submits a job specification, returning a handle on success.
    ///
    /// Failures are reported as [`ClusterError::Submission`]; the
    /// controller retries with backoff up to its configured bound.
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, ClusterError>;

    /// Requests cancellation of a previously submitted job.
    ///
    /// Best-effort: a failure here does not stop the drain — the
    /// worker either disconnects on its own or the drain timeout
    /// forces removal.
    async fn cancel(&self, handle: &JobHandle) -> Result<(), ClusterError>;
}
