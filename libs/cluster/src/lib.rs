//! # batchq-cluster
//!
//! Elastic pools of worker processes running as jobs under an external
//! batch scheduler, presented to callers as a single logical cluster.
//!
//! ## Design Principles
//!
//! - Desired state is declared (`scale`) or computed (`AdaptiveScaler`);
//!   a reconciliation pass converges submitted jobs toward it
//! - One job may produce multiple worker processes (multiplicity); the
//!   controller tracks the job ↔ worker mapping explicitly
//! - Scheduler-specific concerns (submission script syntax, queue
//!   dialects) live behind the [`JobLauncher`] seam; the compute
//!   framework's view of the world arrives through [`DemandOracle`]
//! - Worker state transitions are monotonic:
//!   pending → running → closing → closed
//!
//! ## Components
//!
//! - [`ClusterController`] — owns the plan/requested/observed state and
//!   the reconciliation pass
//! - [`AdaptiveScaler`] — periodic loop driving `scale` from observed
//!   demand, bounded by a min/max window
//! - [`ClusterEvent`] — the notification path for surfaced failures
//!   (exhausted retries, drain timeouts, unknown workers)

pub mod adaptive;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod launcher;
pub mod oracle;
pub mod resources;
pub mod retry;
pub mod spec;

pub use adaptive::{AdaptiveConfig, AdaptiveHandle, AdaptiveScaler, ScalerPhase};
pub use config::{ClusterConfig, RetirementPolicy};
pub use controller::ClusterController;
pub use error::{ClusterError, ClusterResult};
pub use events::{ClusterEvent, ClusterEventKind};
pub use launcher::{JobHandle, JobLauncher};
pub use oracle::DemandOracle;
pub use resources::ResourceRequest;
pub use retry::RetryPolicy;
pub use spec::{JobSpec, JobTemplate, WorkerRecord, WorkerStatus};

pub use batchq_id::{JobId, WorkerName};
