//! Cluster controller configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Policy for selecting which jobs to retire on scale-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetirementPolicy {
    /// Skip jobs with an occupied worker (when the oracle reports
    /// occupancy), breaking ties newest-first. A job holding work is
    /// never retired even if that leaves the cluster above target for
    /// a pass.
    #[default]
    PreferIdle,

    /// Retire the most recently submitted jobs, ignoring occupancy
    /// data entirely.
    NewestFirst,
}

/// Tunables for a cluster controller.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// How long a closing worker may stay connected before it is
    /// force-removed from tracked state.
    pub drain_timeout: Duration,

    /// Poll interval for convergence waits and close drains.
    pub convergence_poll: Duration,

    /// Default bound for [`wait_converged`](crate::ClusterController::wait_converged).
    pub convergence_timeout: Duration,

    /// Backoff schedule for submission attempts.
    pub retry: RetryPolicy,

    /// Window within which failed cancellations are re-attempted
    /// before the drain timeout is left to clean up alone.
    pub cancel_retry_window: Duration,

    /// Scale-down job selection policy.
    pub retirement: RetirementPolicy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            convergence_poll: Duration::from_millis(100),
            convergence_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            cancel_retry_window: Duration::from_secs(60),
            retirement: RetirementPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert_eq!(config.convergence_poll, Duration::from_millis(100));
        assert_eq!(config.retirement, RetirementPolicy::PreferIdle);
        assert_eq!(config.retry.max_attempts, 3);
    }
}
