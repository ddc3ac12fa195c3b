//! Core reconciliation engine for one elastic cluster.
//!
//! The controller:
//! - Owns desired state (job specs), submitted state (job handles) and
//!   observed state (connected worker names) behind one lock
//! - Converges submitted jobs toward the declared worker target on
//!   every `scale` call and on each adaptive tick
//! - Retires jobs safely on scale-down: occupied workers are skipped,
//!   drains are bounded, cancellations are retried
//!
//! All suspension points are oracle queries and launcher submit/cancel
//! calls; confirmations (workers connecting or disconnecting) are
//! absorbed asynchronously as the oracle's reports change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use batchq_id::{JobId, WorkerName};
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::adaptive::{AdaptiveConfig, AdaptiveHandle, AdaptiveScaler};
use crate::config::{ClusterConfig, RetirementPolicy};
use crate::error::{ClusterError, ClusterResult};
use crate::events::{ClusterEvent, ClusterEventKind, EventBus};
use crate::launcher::{JobHandle, JobLauncher};
use crate::oracle::DemandOracle;
use crate::resources::{jobs_for_workers, processes_for_cores, processes_for_memory};
use crate::retry::RetryTracker;
use crate::spec::{JobSpec, JobTemplate, WorkerRecord, WorkerStatus};

/// All mutable cluster state, owned exclusively by the controller.
///
/// The mutex around this struct is the single-writer critical section:
/// a reconciliation pass (from `scale` or an adaptive tick) holds it
/// end to end, so passes never interleave.
struct ClusterState {
    /// Declared desired worker count.
    target_workers: u32,

    /// Desired job specs (the worker-spec store). Keys sort by
    /// submission time because job ULIDs are time-ordered.
    specs: BTreeMap<JobId, JobSpec>,

    /// Jobs submitted and not yet confirmed closed.
    requested: BTreeMap<JobId, JobHandle>,

    /// Worker records; the key set is the plan.
    records: BTreeMap<WorkerName, WorkerRecord>,

    /// Worker names the oracle currently reports connected, filtered
    /// to names the plan accounts for.
    observed: BTreeSet<WorkerName>,

    /// Jobs whose submission exhausted retries this pass. Cleared at
    /// the start of every pass so the next one re-attempts.
    failed: BTreeSet<JobId>,

    /// Jobs whose cancellation failed and awaits a retry.
    pending_cancels: BTreeSet<JobId>,

    /// Bounds cancellation re-attempts per job.
    cancel_failures: RetryTracker,

    /// Unknown workers already warned about, to log each once.
    unknown_logged: BTreeSet<WorkerName>,

    closed: bool,
}

impl ClusterState {
    fn new(config: &ClusterConfig) -> Self {
        Self {
            target_workers: 0,
            specs: BTreeMap::new(),
            requested: BTreeMap::new(),
            records: BTreeMap::new(),
            observed: BTreeSet::new(),
            failed: BTreeSet::new(),
            pending_cancels: BTreeSet::new(),
            cancel_failures: RetryTracker::new(config.retry.max_attempts, config.cancel_retry_window),
            unknown_logged: BTreeSet::new(),
            closed: false,
        }
    }
}

/// Reconciliation engine presenting an elastic pool of batch jobs as a
/// single logical cluster.
pub struct ClusterController {
    launcher: Arc<dyn JobLauncher>,
    oracle: Arc<dyn DemandOracle>,
    template: JobTemplate,
    config: ClusterConfig,
    state: Mutex<ClusterState>,
    events: EventBus,
}

impl ClusterController {
    /// Creates a controller with default configuration.
    pub fn new(
        template: JobTemplate,
        launcher: Arc<dyn JobLauncher>,
        oracle: Arc<dyn DemandOracle>,
    ) -> ClusterResult<Self> {
        Self::with_config(template, launcher, oracle, ClusterConfig::default())
    }

    /// Creates a controller with explicit configuration.
    pub fn with_config(
        template: JobTemplate,
        launcher: Arc<dyn JobLauncher>,
        oracle: Arc<dyn DemandOracle>,
        config: ClusterConfig,
    ) -> ClusterResult<Self> {
        template.validate()?;
        let state = ClusterState::new(&config);
        Ok(Self {
            launcher,
            oracle,
            template,
            config,
            state: Mutex::new(state),
            events: EventBus::new(),
        })
    }

    /// The job template every submission is stamped from.
    pub fn template(&self) -> &JobTemplate {
        &self.template
    }

    /// Controller configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Subscribes to the cluster's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    pub(crate) fn oracle(&self) -> Arc<dyn DemandOracle> {
        Arc::clone(&self.oracle)
    }

    // =========================================================================
    // Scaling surface
    // =========================================================================

    /// Sets the desired worker count to exactly `workers` and runs one
    /// reconciliation pass. The latest target always wins; intermediate
    /// targets are not queued.
    pub async fn scale(&self, workers: u32) -> ClusterResult<()> {
        self.apply_target(|_| workers).await
    }

    /// Scales to enough workers to cover `cores` CPU cores, given the
    /// template's per-process footprint. Rounds up.
    pub async fn scale_cores(&self, cores: u32) -> ClusterResult<()> {
        let workers = processes_for_cores(cores, self.template.resources.cores);
        self.apply_target(|_| workers).await
    }

    /// Scales to enough workers to cover `memory_bytes` of memory,
    /// given the template's per-process footprint. Rounds up.
    pub async fn scale_memory(&self, memory_bytes: u64) -> ClusterResult<()> {
        let workers = processes_for_memory(memory_bytes, self.template.resources.memory_bytes);
        self.apply_target(|_| workers).await
    }

    /// Raises the target by `n` workers.
    pub async fn scale_up(&self, n: u32) -> ClusterResult<()> {
        self.apply_target(|t| t.saturating_add(n)).await
    }

    /// Lowers the target by `n` workers, clamped at zero.
    pub async fn scale_down(&self, n: u32) -> ClusterResult<()> {
        self.apply_target(|t| t.saturating_sub(n)).await
    }

    async fn apply_target(&self, compute: impl FnOnce(u32) -> u32) -> ClusterResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ClusterError::Closed);
        }
        let target = compute(state.target_workers);
        if state.target_workers != target {
            info!(target, previous = state.target_workers, "Scaling cluster");
            state.target_workers = target;
            self.events.publish(ClusterEventKind::Scaled { target });
        }
        self.reconcile(&mut state).await;
        Ok(())
    }

    /// Cancels all outstanding jobs and waits (bounded by the drain
    /// timeout) for observed workers to disconnect. Idempotent: a
    /// second call returns immediately.
    pub async fn close(&self) -> ClusterResult<()> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                debug!("Cluster already closed");
                return Ok(());
            }
            info!(
                jobs = state.requested.len(),
                workers = state.records.len(),
                "Closing cluster"
            );
            state.target_workers = 0;
            let jobs: Vec<JobId> = state.specs.keys().copied().collect();
            for job in jobs {
                self.retire_job(&mut state, job).await;
            }
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                self.observe(&mut state).await;
                self.expire_drains(&mut state).await;
                if state.records.is_empty() && state.requested.is_empty() {
                    state.observed.clear();
                    state.closed = true;
                    self.events.publish(ClusterEventKind::Closed);
                    info!("Cluster closed");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(self.config.convergence_poll).await;
        }

        // Drain bound exceeded: force cancellation and drop tracking.
        // Jobs may leak at the batch-scheduler level; every dropped
        // worker is reported on the event stream.
        let mut state = self.state.lock().await;
        let outstanding: Vec<_> = state
            .requested
            .iter()
            .map(|(job, handle)| (*job, handle.clone()))
            .collect();
        for (job, handle) in outstanding {
            if let Err(e) = self.launcher.cancel(&handle).await {
                warn!(job_id = %job, error = %e, "Forced cancellation failed");
            }
        }
        for record in state.records.values() {
            warn!(
                worker = %record.name,
                job_id = %record.job_id,
                "Worker still tracked at close timeout, dropping"
            );
            self.events.publish(ClusterEventKind::DrainTimedOut {
                worker: record.name.clone(),
                job_id: record.job_id,
            });
        }
        state.records.clear();
        state.observed.clear();
        state.requested.clear();
        state.specs.clear();
        state.pending_cancels.clear();
        state.closed = true;
        self.events.publish(ClusterEventKind::Closed);
        info!("Cluster closed (forced)");
        Ok(())
    }

    // =========================================================================
    // Convergence waits
    // =========================================================================

    /// Waits until the plan matches observed reality, bounded by the
    /// configured convergence timeout.
    pub async fn wait_converged(&self) -> ClusterResult<()> {
        self.wait_converged_for(self.config.convergence_timeout).await
    }

    /// Waits until every planned worker is connected and no drain is in
    /// flight, or `timeout` elapses.
    ///
    /// Each poll runs a full reconciliation pass, so failed submissions
    /// are re-attempted while waiting.
    pub async fn wait_converged_for(&self, timeout: Duration) -> ClusterResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if !state.closed {
                    self.reconcile(&mut state).await;
                }
                if self.is_converged(&state) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::ConvergenceTimeout { timeout });
            }
            sleep(self.config.convergence_poll).await;
        }
    }

    fn is_converged(&self, state: &ClusterState) -> bool {
        let target_jobs = jobs_for_workers(state.target_workers, self.template.processes) as usize;
        let target_records = target_jobs * self.template.processes as usize;

        state.specs.len() == target_jobs
            && state.requested.len() == target_jobs
            && state.records.len() == target_records
            && state.records.values().all(|r| r.status == WorkerStatus::Running)
            && state.observed.len() == state.records.len()
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Worker names the cluster is converging toward.
    pub async fn plan(&self) -> BTreeSet<WorkerName> {
        self.state.lock().await.records.keys().cloned().collect()
    }

    /// Currently connected workers and their records.
    pub async fn workers(&self) -> BTreeMap<WorkerName, WorkerRecord> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .filter(|(name, _)| state.observed.contains(*name))
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect()
    }

    /// Desired job specifications by job id.
    pub async fn worker_spec(&self) -> BTreeMap<JobId, JobSpec> {
        self.state.lock().await.specs.clone()
    }

    /// Jobs submitted and not yet confirmed closed.
    pub async fn requested(&self) -> BTreeSet<JobId> {
        self.state.lock().await.requested.keys().copied().collect()
    }

    /// The declared worker target.
    pub async fn target(&self) -> u32 {
        self.state.lock().await.target_workers
    }

    /// Jobs whose submission exhausted retries in the latest pass.
    pub async fn failed_jobs(&self) -> BTreeSet<JobId> {
        self.state.lock().await.failed.clone()
    }

    /// Whether `close` has completed.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    // =========================================================================
    // Adaptive scaling
    // =========================================================================

    /// Starts an adaptive control loop driving this cluster's target
    /// from observed demand. The returned handle stops the loop without
    /// interrupting an in-flight pass.
    pub fn adapt(self: &Arc<Self>, config: AdaptiveConfig) -> AdaptiveHandle {
        AdaptiveScaler::new(Arc::clone(self), config).spawn()
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// One reconciliation pass. Runs with the state lock held.
    async fn reconcile(&self, state: &mut ClusterState) {
        state.failed.clear();
        self.observe(state).await;
        self.expire_drains(state).await;

        let target_jobs = jobs_for_workers(state.target_workers, self.template.processes) as usize;
        let desired_now = state.specs.len();

        if target_jobs > desired_now {
            self.submit_missing(state, (target_jobs - desired_now) as u32).await;
        } else if target_jobs < desired_now {
            self.retire_surplus(state, desired_now - target_jobs).await;
        }
    }

    /// Refreshes observed state from the oracle: promotes connected
    /// pending workers, completes confirmed drains, ignores workers no
    /// requested job accounts for.
    async fn observe(&self, state: &mut ClusterState) {
        let connected = match self.oracle.current_workers().await {
            Ok(connected) => connected,
            Err(e) => {
                warn!(error = %e, "Worker query failed, keeping last observed state");
                return;
            }
        };

        for name in &connected {
            if !state.records.contains_key(name) && state.unknown_logged.insert(name.clone()) {
                warn!(worker = %name, "Observed worker with no owning job, ignoring");
                self.events.publish(ClusterEventKind::UnknownWorkerObserved {
                    worker: name.clone(),
                });
            }
        }
        state.unknown_logged.retain(|name| connected.contains(name));

        state.observed = connected
            .into_iter()
            .filter(|name| state.records.contains_key(name))
            .collect();

        for name in &state.observed {
            if let Some(record) = state.records.get_mut(name) {
                if record.status == WorkerStatus::Pending
                    && record.advance(WorkerStatus::Running).is_ok()
                {
                    debug!(worker = %name, job_id = %record.job_id, "Worker connected");
                }
            }
        }

        let drained: Vec<WorkerName> = state
            .records
            .values()
            .filter(|r| r.status == WorkerStatus::Closing && !state.observed.contains(&r.name))
            .map(|r| r.name.clone())
            .collect();
        for name in drained {
            if let Some(mut record) = state.records.remove(&name) {
                let _ = record.advance(WorkerStatus::Closed);
                debug!(worker = %name, job_id = %record.job_id, "Worker drained");
                self.finish_job_if_empty(state, record.job_id);
            }
        }
    }

    /// Force-removes closing workers past the drain bound and retries
    /// failed cancellations.
    async fn expire_drains(&self, state: &mut ClusterState) {
        let timeout = self.config.drain_timeout;
        let expired: Vec<WorkerName> = state
            .records
            .values()
            .filter(|r| {
                r.status == WorkerStatus::Closing
                    && r.closing_elapsed().is_some_and(|e| e > timeout)
            })
            .map(|r| r.name.clone())
            .collect();

        for name in expired {
            if let Some(record) = state.records.remove(&name) {
                warn!(
                    worker = %name,
                    job_id = %record.job_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Drain timed out, force-removing worker"
                );
                self.events.publish(ClusterEventKind::DrainTimedOut {
                    worker: name.clone(),
                    job_id: record.job_id,
                });
                state.observed.remove(&name);
                self.finish_job_if_empty(state, record.job_id);
            }
        }

        let retry: Vec<JobId> = state
            .pending_cancels
            .iter()
            .copied()
            .filter(|job| !state.cancel_failures.is_exhausted(*job))
            .collect();
        for job in retry {
            let Some(handle) = state.requested.get(&job).cloned() else {
                state.pending_cancels.remove(&job);
                continue;
            };
            match self.launcher.cancel(&handle).await {
                Ok(()) => {
                    state.pending_cancels.remove(&job);
                    state.cancel_failures.clear(job);
                    info!(job_id = %job, "Job cancelled on retry");
                    self.events.publish(ClusterEventKind::JobCancelled { job_id: job });
                }
                Err(e) => {
                    let exhausted = state.cancel_failures.record_failure(job);
                    warn!(job_id = %job, error = %e, exhausted, "Cancellation retry failed");
                }
            }
        }
    }

    /// Submits `deficit` fresh jobs, each with bounded retry/backoff.
    /// Only transient errors are retried; anything else fails the job
    /// immediately and surfaces on the event stream.
    async fn submit_missing(&self, state: &mut ClusterState, deficit: u32) {
        for _ in 0..deficit {
            let spec = self.template.stamp();
            let job_id = spec.id;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match self.launcher.submit(&spec).await {
                    Ok(handle) => {
                        info!(
                            job_id = %job_id,
                            handle = %handle,
                            processes = spec.processes,
                            "Job submitted"
                        );
                        for name in spec.worker_names() {
                            state
                                .records
                                .insert(name.clone(), WorkerRecord::pending(name, job_id));
                        }
                        state.requested.insert(job_id, handle);
                        state.specs.insert(job_id, spec);
                        self.events.publish(ClusterEventKind::JobSubmitted { job_id });
                        break;
                    }
                    Err(e) if e.is_transient() && attempt < self.config.retry.max_attempts => {
                        let delay = self.config.retry.delay_for(attempt);
                        warn!(
                            job_id = %job_id,
                            attempt,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Submission failed, retrying"
                        );
                        sleep(delay).await;
                    }
                    Err(e) => {
                        error!(
                            job_id = %job_id,
                            attempts = attempt,
                            error = %e,
                            "Submission failed, giving up until next pass"
                        );
                        state.failed.insert(job_id);
                        self.events.publish(ClusterEventKind::SubmissionFailed {
                            job_id,
                            attempts: attempt,
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }
    }

    /// Selects and retires up to `surplus` jobs, newest first, skipping
    /// jobs that hold work when the policy and oracle allow telling.
    async fn retire_surplus(&self, state: &mut ClusterState, surplus: usize) {
        let candidates: Vec<JobId> = state.specs.keys().rev().copied().collect();
        let mut selected = Vec::new();

        for job in candidates {
            if selected.len() == surplus {
                break;
            }
            if self.config.retirement == RetirementPolicy::PreferIdle
                && self.job_occupied(state, job).await
            {
                debug!(job_id = %job, "Skipping occupied job for retirement");
                continue;
            }
            selected.push(job);
        }

        if selected.len() < surplus {
            debug!(
                wanted = surplus,
                eligible = selected.len(),
                "Fewer idle jobs than surplus, retiring only what is safe"
            );
        }

        for job in selected {
            self.retire_job(state, job).await;
        }
    }

    async fn job_occupied(&self, state: &ClusterState, job: JobId) -> bool {
        for record in state.records.values().filter(|r| r.job_id == job) {
            if self.oracle.worker_occupied(&record.name).await == Some(true) {
                return true;
            }
        }
        false
    }

    /// Retires one job: drops its spec from desired state, marks its
    /// workers closing, requests cooperative retirement, cancels the
    /// handle. The handle stays in `requested` until the drain
    /// completes or times out.
    async fn retire_job(&self, state: &mut ClusterState, job: JobId) {
        state.specs.remove(&job);

        let names: Vec<WorkerName> = state
            .records
            .values()
            .filter(|r| r.job_id == job)
            .map(|r| r.name.clone())
            .collect();
        info!(job_id = %job, workers = names.len(), "Retiring job");

        for name in &names {
            if let Some(record) = state.records.get_mut(name) {
                if let Err((from, to)) = record.advance(WorkerStatus::Closing) {
                    debug!(worker = %name, %from, %to, "Skipping illegal transition");
                    continue;
                }
            }
            if self.oracle.retire_worker(name).await {
                debug!(worker = %name, "Cooperative retirement accepted");
            }
        }

        let Some(handle) = state.requested.get(&job).cloned() else {
            return;
        };
        match self.launcher.cancel(&handle).await {
            Ok(()) => {
                info!(job_id = %job, "Job cancelled");
                self.events.publish(ClusterEventKind::JobCancelled { job_id: job });
            }
            Err(e) => {
                warn!(job_id = %job, error = %e, "Cancellation failed, will retry");
                state.pending_cancels.insert(job);
                state.cancel_failures.record_failure(job);
                self.events.publish(ClusterEventKind::CancellationFailed {
                    job_id: job,
                    message: e.to_string(),
                });
            }
        }
    }

    fn finish_job_if_empty(&self, state: &mut ClusterState, job: JobId) {
        let has_records = state.records.values().any(|r| r.job_id == job);
        if !has_records {
            state.requested.remove(&job);
            state.pending_cancels.remove(&job);
            state.cancel_failures.clear(job);
            debug!(job_id = %job, "Job fully drained");
        }
    }
}

// Controller tests exercising the public API live in tests/controller.rs:
// they use `batchq_testing::FakeBatch`, and `batchq-testing` depends on this
// crate, so a unit-test module here would link two copies of the library.
