//! The seam to the distributed-computation scheduler.
//!
//! The oracle is the source of observed truth: which workers are
//! actually connected, and how much work is outstanding. Occupancy and
//! cooperative retirement are optional capabilities with conservative
//! defaults, so a minimal oracle only implements the two queries.

use std::collections::BTreeSet;

use async_trait::async_trait;
use batchq_id::WorkerName;

use crate::error::ClusterError;

/// Reports connected workers and outstanding demand.
#[async_trait]
pub trait DemandOracle: Send + Sync {
    /// Names of the workers currently connected to the compute
    /// scheduler.
    async fn current_workers(&self) -> Result<BTreeSet<WorkerName>, ClusterError>;

    /// Outstanding demand in worker slots: one slot per unit of
    /// pending-or-executing work. Drives the adaptive target.
    async fn pending_demand(&self) -> Result<u32, ClusterError>;

    /// Whether `name` currently holds an assigned unit of work.
    ///
    /// `None` means the oracle cannot tell; the retirement policy then
    /// falls back to submission-order selection.
    async fn worker_occupied(&self, name: &WorkerName) -> Option<bool> {
        let _ = name;
        None
    }

    /// Asks the compute scheduler to retire `name` cooperatively
    /// before the job is cancelled.
    ///
    /// Returns whether the request was accepted. The default declines,
    /// which simply means the drain relies on job cancellation alone.
    async fn retire_worker(&self, name: &WorkerName) -> bool {
        let _ = name;
        false
    }
}
