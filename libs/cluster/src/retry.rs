//! Retry policy and windowed failure tracking.
//!
//! Submissions retry inline with exponential backoff governed by
//! [`RetryPolicy`]. Cancellations retry across reconciliation passes;
//! [`RetryTracker`] bounds how often a job's cancellation is
//! re-attempted within a window before the drain timeout takes over.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use batchq_id::JobId;

/// Bounded exponential backoff for submission attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Tracks per-job failures within a rolling window.
///
/// Returns exhaustion once a job fails more than `max_retries` times
/// inside the window; the count resets when the window elapses or the
/// job succeeds.
#[derive(Debug)]
pub struct RetryTracker {
    max_retries: u32,
    window: Duration,
    failures: BTreeMap<JobId, (u32, Instant)>,
}

impl RetryTracker {
    /// Creates a tracker allowing `max_retries` failures per `window`.
    #[must_use]
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Records a failure for `job`. Returns true once retries are
    /// exhausted.
    pub fn record_failure(&mut self, job: JobId) -> bool {
        let now = Instant::now();
        let (count, first) = self.failures.entry(job).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Whether retries are exhausted for `job`.
    #[must_use]
    pub fn is_exhausted(&self, job: JobId) -> bool {
        let Some((count, first)) = self.failures.get(&job) else {
            return false;
        };
        if first.elapsed() > self.window {
            return false;
        }
        *count > self.max_retries
    }

    /// Clears failure tracking for `job` (on success or removal).
    pub fn clear(&mut self, job: JobId) {
        self.failures.remove(&job);
    }

    /// Drops entries whose window has elapsed.
    pub fn prune(&mut self) {
        self.failures.retain(|_, (_, first)| first.elapsed() <= self.window);
    }
}
