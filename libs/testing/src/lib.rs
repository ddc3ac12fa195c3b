//! # batchq-testing
//!
//! An in-process stand-in for both external collaborators of a
//! cluster: the batch scheduler (job submission and cancellation) and
//! the compute scheduler (connected workers, demand, occupancy).
//!
//! [`FakeBatch`] implements [`JobLauncher`] and [`DemandOracle`] on the
//! same shared state, so a submitted job's workers show up as
//! connected after a configurable latency and disappear again when the
//! job is cancelled — enough behavior to exercise the whole
//! reconciliation loop without a real scheduler.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use batchq_cluster::{ClusterError, DemandOracle, JobHandle, JobLauncher, JobSpec};
use batchq_id::{JobId, WorkerName};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct FakeJob {
    job_id: JobId,
    workers: Vec<WorkerName>,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    next_handle: u64,
    jobs: BTreeMap<String, FakeJob>,
    connected: BTreeSet<WorkerName>,
    occupied: BTreeSet<WorkerName>,
    demand: u32,
    fail_submissions: u32,
    fail_cancels: u32,
    fail_demand: bool,
    stubborn: bool,
    submit_attempts: u32,
    cancelled_handles: Vec<String>,
}

/// Fake batch scheduler and demand oracle sharing one state.
#[derive(Debug)]
pub struct FakeBatch {
    connect_delay: Duration,
    inner: Arc<Mutex<FakeState>>,
}

impl FakeBatch {
    /// Creates a fake whose workers connect `connect_delay` after a
    /// successful submission.
    #[must_use]
    pub fn new(connect_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            connect_delay,
            inner: Arc::new(Mutex::new(FakeState::default())),
        })
    }

    /// Creates a fake whose workers connect immediately.
    #[must_use]
    pub fn instant() -> Arc<Self> {
        Self::new(Duration::ZERO)
    }

    // =========================================================================
    // Knobs
    // =========================================================================

    /// Sets the outstanding demand reported to the adaptive loop.
    pub async fn set_demand(&self, demand: u32) {
        self.inner.lock().await.demand = demand;
    }

    /// Makes the next `n` submissions fail.
    pub async fn fail_next_submissions(&self, n: u32) {
        self.inner.lock().await.fail_submissions = n;
    }

    /// Makes the next `n` cancellations fail.
    pub async fn fail_next_cancels(&self, n: u32) {
        self.inner.lock().await.fail_cancels = n;
    }

    /// Makes demand queries fail until switched back.
    pub async fn fail_demand_queries(&self, fail: bool) {
        self.inner.lock().await.fail_demand = fail;
    }

    /// When stubborn, workers decline cooperative retirement and stay
    /// connected after their job is cancelled, forcing drain timeouts.
    pub async fn set_stubborn(&self, stubborn: bool) {
        self.inner.lock().await.stubborn = stubborn;
    }

    /// Marks a worker as holding a unit of work.
    pub async fn occupy(&self, name: &WorkerName) {
        self.inner.lock().await.occupied.insert(name.clone());
    }

    /// Clears a worker's occupancy.
    pub async fn release(&self, name: &WorkerName) {
        self.inner.lock().await.occupied.remove(name);
    }

    /// Connects a worker no submitted job accounts for.
    pub async fn connect_rogue(&self, name: WorkerName) {
        self.inner.lock().await.connected.insert(name);
    }

    /// Simulates a worker dying independently of its job.
    pub async fn disconnect(&self, name: &WorkerName) {
        self.inner.lock().await.connected.remove(name);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Snapshot of connected worker names.
    pub async fn connected(&self) -> BTreeSet<WorkerName> {
        self.inner.lock().await.connected.clone()
    }

    /// Total submission attempts, including rejected ones.
    pub async fn submit_attempts(&self) -> u32 {
        self.inner.lock().await.submit_attempts
    }

    /// Handles cancelled so far, in order.
    pub async fn cancelled_handles(&self) -> Vec<String> {
        self.inner.lock().await.cancelled_handles.clone()
    }

    /// Job ids of jobs cancelled so far.
    pub async fn cancelled_jobs(&self) -> BTreeSet<JobId> {
        let state = self.inner.lock().await;
        state
            .jobs
            .values()
            .filter(|j| j.cancelled)
            .map(|j| j.job_id)
            .collect()
    }
}

#[async_trait]
impl JobLauncher for FakeBatch {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, ClusterError> {
        let mut state = self.inner.lock().await;
        state.submit_attempts += 1;

        if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            return Err(ClusterError::Submission(
                "queue rejected the job".to_string(),
            ));
        }

        state.next_handle += 1;
        let token = format!("fake-{}", state.next_handle);
        let workers = spec.worker_names();
        state.jobs.insert(
            token.clone(),
            FakeJob {
                job_id: spec.id,
                workers: workers.clone(),
                cancelled: false,
            },
        );
        debug!(handle = %token, job_id = %spec.id, "Fake job accepted");
        drop(state);

        // Workers connect after the configured latency, unless the job
        // was cancelled in the meantime.
        let inner = Arc::clone(&self.inner);
        let delay = self.connect_delay;
        let connect_token = token.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut state = inner.lock().await;
            if let Some(job) = state.jobs.get(&connect_token) {
                if !job.cancelled {
                    let workers = job.workers.clone();
                    state.connected.extend(workers);
                }
            }
        });

        Ok(JobHandle::new(token))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), ClusterError> {
        let mut state = self.inner.lock().await;

        if state.fail_cancels > 0 {
            state.fail_cancels -= 1;
            return Err(ClusterError::Cancellation(
                "scheduler unreachable".to_string(),
            ));
        }

        let stubborn = state.stubborn;
        if let Some(job) = state.jobs.get_mut(handle.as_str()) {
            job.cancelled = true;
            let workers = job.workers.clone();
            if !stubborn {
                for name in &workers {
                    state.connected.remove(name);
                    state.occupied.remove(name);
                }
            }
        }
        state.cancelled_handles.push(handle.as_str().to_string());
        Ok(())
    }
}

#[async_trait]
impl DemandOracle for FakeBatch {
    async fn current_workers(&self) -> Result<BTreeSet<WorkerName>, ClusterError> {
        Ok(self.inner.lock().await.connected.clone())
    }

    async fn pending_demand(&self) -> Result<u32, ClusterError> {
        let state = self.inner.lock().await;
        if state.fail_demand {
            return Err(ClusterError::DemandQuery(
                "scheduler unreachable".to_string(),
            ));
        }
        Ok(state.demand)
    }

    async fn worker_occupied(&self, name: &WorkerName) -> Option<bool> {
        Some(self.inner.lock().await.occupied.contains(name))
    }

    async fn retire_worker(&self, name: &WorkerName) -> bool {
        let mut state = self.inner.lock().await;
        if state.stubborn {
            return false;
        }
        // Cooperative retirement: the worker deregisters right away.
        state.connected.remove(name)
    }
}

/// Polls `cond` every 25 ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
