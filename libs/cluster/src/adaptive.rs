//! Adaptive scaling loop.
//!
//! Periodically converts the oracle's demand signal into a worker
//! target inside a `[minimum, maximum]` window and pushes it into the
//! controller. A failed demand query skips the tick; nothing a tick
//! does can terminate the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::ClusterController;
use crate::error::ClusterError;
use crate::oracle::DemandOracle;
use crate::resources::jobs_for_workers;

/// Bounds and cadence for adaptive scaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveConfig {
    /// Lower worker bound; the cluster never shrinks below it.
    pub minimum: u32,

    /// Upper worker bound; demand saturates here.
    pub maximum: u32,

    /// Interval between demand polls.
    pub interval: Duration,

    /// Ignore target changes of at most this many workers.
    pub deadband: u32,
}

impl AdaptiveConfig {
    /// Creates a config with the given bounds, a 1 s interval, and no
    /// deadband.
    #[must_use]
    pub fn new(minimum: u32, maximum: u32) -> Self {
        Self {
            minimum,
            maximum,
            interval: Duration::from_secs(1),
            deadband: 0,
        }
    }

    /// Sets the poll interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the no-op threshold.
    #[must_use]
    pub fn with_deadband(mut self, deadband: u32) -> Self {
        self.deadband = deadband;
        self
    }
}

/// Lifecycle of the adaptive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalerPhase {
    /// Not started, or stopped.
    Stopped,

    /// Polling demand between adjustments.
    Running,

    /// Applying a new target to the controller.
    Adjusting,
}

/// Periodic control loop computing scale targets from demand.
pub struct AdaptiveScaler {
    cluster: Arc<ClusterController>,
    oracle: Arc<dyn DemandOracle>,
    config: AdaptiveConfig,
    phase: watch::Sender<ScalerPhase>,
}

impl AdaptiveScaler {
    /// Creates a scaler for `cluster`, polling the cluster's oracle.
    #[must_use]
    pub fn new(cluster: Arc<ClusterController>, config: AdaptiveConfig) -> Self {
        let oracle = cluster.oracle();
        let (phase, _) = watch::channel(ScalerPhase::Stopped);
        Self {
            cluster,
            oracle,
            config,
            phase,
        }
    }

    /// Spawns the loop onto the runtime, returning a stop handle.
    #[must_use]
    pub fn spawn(self) -> AdaptiveHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let phase_rx = self.phase.subscribe();
        let join = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });
        AdaptiveHandle {
            shutdown: shutdown_tx,
            phase: phase_rx,
            join,
        }
    }

    /// Runs the loop until shutdown is signaled.
    ///
    /// Shutdown only stops scheduling future ticks: a tick that already
    /// started runs to completion, so an in-flight reconciliation is
    /// never cancelled midway.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            minimum = self.config.minimum,
            maximum = self.config.maximum,
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting adaptive scaler"
        );
        let _ = self.phase.send(ScalerPhase::Running);

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Adaptive scaler shutting down");
                        break;
                    }
                }
            }
        }

        let _ = self.phase.send(ScalerPhase::Stopped);
    }

    /// One adaptive pass: poll demand, clamp, scale if it moves the
    /// plan beyond the deadband.
    async fn tick(&self) {
        let demand = match self.oracle.pending_demand().await {
            Ok(demand) => demand,
            Err(e) => {
                // Transient: keep the previous target, try again next tick.
                warn!(error = %e, "Demand query failed, skipping tick");
                return;
            }
        };

        let target = demand.clamp(self.config.minimum, self.config.maximum);

        // Compare against what the plan would actually hold after
        // multiplicity rounding, so a target inside the same job is a
        // no-op rather than a scale call every tick.
        let processes = self.cluster.template().processes;
        let effective = jobs_for_workers(target, processes) * processes;
        let plan_size = self.cluster.plan().await.len() as u32;

        if effective.abs_diff(plan_size) <= self.config.deadband {
            debug!(demand, target, plan_size, "Within deadband, no adjustment");
            return;
        }

        debug!(demand, target, plan_size, "Adjusting cluster target");
        let _ = self.phase.send(ScalerPhase::Adjusting);
        match self.cluster.scale(target).await {
            Ok(()) => {}
            Err(ClusterError::Closed) => {
                debug!("Cluster closed, adaptive tick ignored");
            }
            Err(e) => {
                warn!(error = %e, "Adaptive scale failed");
            }
        }
        let _ = self.phase.send(ScalerPhase::Running);
    }
}

/// Stops an [`AdaptiveScaler`] spawned with [`AdaptiveScaler::spawn`].
pub struct AdaptiveHandle {
    shutdown: watch::Sender<bool>,
    phase: watch::Receiver<ScalerPhase>,
    join: JoinHandle<()>,
}

impl AdaptiveHandle {
    /// Current phase of the loop.
    #[must_use]
    pub fn phase(&self) -> ScalerPhase {
        *self.phase.borrow()
    }

    /// Signals shutdown and waits for the loop to finish its current
    /// tick and exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}
