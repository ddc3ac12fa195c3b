//! End-to-end scaling behavior against the in-process fake scheduler.
//!
//! These scenarios exercise the full reconciliation loop: submission,
//! asynchronous worker connection, retirement selection, drains, and
//! the failure-surfacing paths.

use std::sync::Arc;
use std::time::Duration;

use batchq_cluster::{
    ClusterConfig, ClusterController, ClusterError, ClusterEvent, ClusterEventKind, DemandOracle,
    JobLauncher, JobTemplate, ResourceRequest, RetryPolicy,
};
use batchq_testing::FakeBatch;
use tokio::sync::broadcast;

const CONNECT_DELAY: Duration = Duration::from_millis(25);
const BOUND: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn template(processes: u32) -> JobTemplate {
    JobTemplate::new("pool", ResourceRequest::with_memory(1, "1 GB").unwrap())
        .with_processes(processes)
}

fn cluster(fake: &Arc<FakeBatch>, template: JobTemplate) -> Arc<ClusterController> {
    init_tracing();
    Arc::new(
        ClusterController::new(
            template,
            Arc::clone(fake) as Arc<dyn JobLauncher>,
            Arc::clone(fake) as Arc<dyn DemandOracle>,
        )
        .unwrap(),
    )
}

fn cluster_with(
    fake: &Arc<FakeBatch>,
    template: JobTemplate,
    config: ClusterConfig,
) -> Arc<ClusterController> {
    init_tracing();
    Arc::new(
        ClusterController::with_config(
            template,
            Arc::clone(fake) as Arc<dyn JobLauncher>,
            Arc::clone(fake) as Arc<dyn DemandOracle>,
            config,
        )
        .unwrap(),
    )
}

async fn expect_event(
    rx: &mut broadcast::Receiver<ClusterEvent>,
    pred: impl Fn(&ClusterEventKind) -> bool,
) -> ClusterEventKind {
    tokio::time::timeout(BOUND, async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event.kind) {
                return event.kind;
            }
        }
    })
    .await
    .expect("expected event within bound")
}

#[tokio::test]
async fn scale_up_then_down_retires_newest_job() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(1));

    cluster.scale(2).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();
    assert_eq!(cluster.workers().await.len(), 2);
    assert_eq!(cluster.worker_spec().await.len(), 2);

    let jobs: Vec<_> = cluster.worker_spec().await.keys().copied().collect();
    let oldest = jobs[0];
    let newest = jobs[1];

    cluster.scale(1).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    assert_eq!(cluster.workers().await.len(), 1);
    let remaining: Vec<_> = cluster.worker_spec().await.keys().copied().collect();
    assert_eq!(remaining, vec![oldest]);
    assert!(fake.cancelled_jobs().await.contains(&newest));
}

#[tokio::test]
async fn scale_to_zero_empties_every_set() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(1));

    cluster.scale(3).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();
    assert_eq!(cluster.plan().await.len(), 3);

    cluster.scale(0).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    assert!(cluster.plan().await.is_empty());
    assert!(cluster.workers().await.is_empty());
    assert!(cluster.worker_spec().await.is_empty());
    assert!(cluster.requested().await.is_empty());
    assert!(fake.connected().await.is_empty());
}

#[tokio::test]
async fn multiplicity_groups_workers_into_jobs() {
    // Two worker processes per job, one core per process.
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(2));

    cluster.scale_cores(2).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    // Two workers, one job.
    assert_eq!(cluster.workers().await.len(), 2);
    assert_eq!(cluster.worker_spec().await.len(), 1);
    let planned = cluster.plan().await;
    assert_eq!(planned, fake.connected().await);

    // One core still needs the same job; the worker group stays whole.
    cluster.scale_cores(1).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.workers().await.len(), 2);
    assert_eq!(cluster.worker_spec().await.len(), 1);
}

#[tokio::test]
async fn multiplicity_rounds_jobs_up() {
    // Three workers over two-process jobs → two jobs, four workers.
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(2));

    cluster.scale(3).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    assert_eq!(cluster.worker_spec().await.len(), 2);
    assert_eq!(cluster.workers().await.len(), 4);
}

#[tokio::test]
async fn close_is_idempotent() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(1));

    cluster.scale(2).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    cluster.close().await.unwrap();
    assert!(cluster.is_closed().await);
    assert!(cluster.plan().await.is_empty());
    assert!(cluster.workers().await.is_empty());
    assert!(cluster.worker_spec().await.is_empty());
    assert!(cluster.requested().await.is_empty());

    // Second close is a no-op.
    cluster.close().await.unwrap();
    assert!(cluster.plan().await.is_empty());
}

#[tokio::test]
async fn occupied_worker_survives_scale_down() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(1));

    cluster.scale(2).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    // Occupy the newest job's worker; retirement prefers it otherwise.
    let newest = *cluster.worker_spec().await.keys().last().unwrap();
    let busy = cluster
        .workers()
        .await
        .values()
        .find(|r| r.job_id == newest)
        .map(|r| r.name.clone())
        .unwrap();
    fake.occupy(&busy).await;

    cluster.scale(1).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    let workers = cluster.workers().await;
    assert_eq!(workers.len(), 1);
    assert!(workers.contains_key(&busy), "occupied worker was retired");
}

#[tokio::test]
async fn fully_occupied_cluster_resists_scale_down() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(1));

    cluster.scale(2).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    for name in cluster.plan().await {
        fake.occupy(&name).await;
    }

    // No job is safe to retire; the cluster stays above target.
    cluster.scale(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cluster.workers().await.len(), 2);

    // Releasing one worker lets the next pass retire its job.
    let victim = cluster.plan().await.iter().next_back().cloned().unwrap();
    fake.release(&victim).await;
    cluster.wait_converged_for(BOUND).await.unwrap();
    assert_eq!(cluster.workers().await.len(), 1);
}

#[tokio::test]
async fn submission_retry_recovers_within_a_pass() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let config = ClusterConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        ..ClusterConfig::default()
    };
    let cluster = cluster_with(&fake, template(1), config);

    fake.fail_next_submissions(1).await;
    cluster.scale(1).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    assert_eq!(cluster.workers().await.len(), 1);
    assert_eq!(fake.submit_attempts().await, 2);
}

#[tokio::test]
async fn exhausted_submission_surfaces_then_later_pass_recovers() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let config = ClusterConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        },
        ..ClusterConfig::default()
    };
    let cluster = cluster_with(&fake, template(1), config);
    let mut events = cluster.subscribe();

    // Both attempts of the first pass fail.
    fake.fail_next_submissions(2).await;
    cluster.scale(1).await.unwrap();

    let kind = expect_event(&mut events, |k| {
        matches!(k, ClusterEventKind::SubmissionFailed { .. })
    })
    .await;
    let ClusterEventKind::SubmissionFailed { job_id, attempts, .. } = kind else {
        unreachable!()
    };
    assert_eq!(attempts, 2);
    assert!(cluster.failed_jobs().await.contains(&job_id));

    // Convergence polling re-runs the pass, which now succeeds, and
    // the recovered pass leaves no failed jobs behind.
    cluster.wait_converged_for(BOUND).await.unwrap();
    assert_eq!(cluster.workers().await.len(), 1);
    assert!(cluster.failed_jobs().await.is_empty());
}

#[tokio::test]
async fn convergence_wait_times_out_when_submissions_keep_failing() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let config = ClusterConfig {
        retry: RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
        },
        ..ClusterConfig::default()
    };
    let cluster = cluster_with(&fake, template(1), config);

    fake.fail_next_submissions(1000).await;
    cluster.scale(1).await.unwrap();

    let err = cluster
        .wait_converged_for(Duration::from_millis(400))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::ConvergenceTimeout { .. }));
}

#[tokio::test]
async fn unknown_worker_is_ignored_not_adopted() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(1));
    let mut events = cluster.subscribe();

    fake.connect_rogue("rogue-1".parse().unwrap()).await;

    cluster.scale(1).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    assert_eq!(cluster.workers().await.len(), 1);
    assert!(!cluster.plan().await.iter().any(|n| n.as_str() == "rogue-1"));

    let kind = expect_event(&mut events, |k| {
        matches!(k, ClusterEventKind::UnknownWorkerObserved { .. })
    })
    .await;
    let ClusterEventKind::UnknownWorkerObserved { worker } = kind else {
        unreachable!()
    };
    assert_eq!(worker.as_str(), "rogue-1");
}

#[tokio::test]
async fn latest_target_wins() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(1));

    cluster.scale(5).await.unwrap();
    cluster.scale(1).await.unwrap();
    assert_eq!(cluster.target().await, 1);

    cluster.wait_converged_for(BOUND).await.unwrap();
    assert_eq!(cluster.workers().await.len(), 1);
    assert_eq!(cluster.worker_spec().await.len(), 1);
}

#[tokio::test]
async fn stubborn_worker_is_force_removed_after_drain_timeout() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let config = ClusterConfig {
        drain_timeout: Duration::from_millis(200),
        ..ClusterConfig::default()
    };
    let cluster = cluster_with(&fake, template(1), config);
    let mut events = cluster.subscribe();

    cluster.scale(1).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    fake.set_stubborn(true).await;
    cluster.scale(0).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    expect_event(&mut events, |k| {
        matches!(k, ClusterEventKind::DrainTimedOut { .. })
    })
    .await;
    assert!(cluster.plan().await.is_empty());
    assert!(cluster.requested().await.is_empty());
}

#[tokio::test]
async fn failed_cancellation_is_surfaced() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(1));
    let mut events = cluster.subscribe();

    cluster.scale(1).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    fake.fail_next_cancels(1).await;
    cluster.scale(0).await.unwrap();

    expect_event(&mut events, |k| {
        matches!(k, ClusterEventKind::CancellationFailed { .. })
    })
    .await;

    // The worker still drains (cooperative retirement succeeded), so
    // the cluster converges to empty regardless.
    cluster.wait_converged_for(BOUND).await.unwrap();
    assert!(cluster.workers().await.is_empty());
}

#[tokio::test]
async fn plan_matches_connected_after_convergence() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(1));

    cluster.scale_up(3).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();
    assert_eq!(cluster.plan().await, fake.connected().await);

    cluster.scale_down(2).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();
    assert_eq!(cluster.plan().await, fake.connected().await);
    assert_eq!(cluster.plan().await.len(), 1);
}

#[tokio::test]
async fn dead_worker_blocks_convergence_until_timeout() {
    let fake = FakeBatch::new(CONNECT_DELAY);
    let cluster = cluster(&fake, template(1));

    cluster.scale(1).await.unwrap();
    cluster.wait_converged_for(BOUND).await.unwrap();

    // A worker dying independently leaves the plan short of observed.
    let name = cluster.plan().await.iter().next().cloned().unwrap();
    fake.disconnect(&name).await;

    let err = cluster
        .wait_converged_for(Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::ConvergenceTimeout { .. }));

    // The record is still planned; only the observation is gone.
    assert!(cluster.plan().await.contains(&name));
    assert!(!cluster.workers().await.contains_key(&name));
}
