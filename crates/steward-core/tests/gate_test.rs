//! Integration tests for dependency gates: single-level chains unlock on
//! completion and fail fast on dependency failure.

mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use steward_core::gate::GateWorker;
use steward_core::tracker::{CreateJobParams, JobTracker};
use steward_db::models::{GateState, JobStatus, LaunchState};
use steward_db::queries::{gates as gate_db, jobs as job_db};
use steward_test_utils::TestDb;

use common::{test_config, wait_until};

struct Harness {
    db: TestDb,
    pool: sqlx::PgPool,
    tracker: JobTracker,
    cancel: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        let db = TestDb::new().await;
        let pool = db.pool().clone();
        let config = Arc::new(test_config());

        let cancel = CancellationToken::new();
        let worker = GateWorker {
            pool: pool.clone(),
            config: Arc::clone(&config),
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run());

        let tracker = JobTracker::new(pool.clone(), config);
        Self {
            db,
            pool,
            tracker,
            cancel,
        }
    }

    async fn finish(self) {
        self.cancel.cancel();
        self.db.close().await;
    }
}

fn job(target: &str, task: &str) -> CreateJobParams {
    CreateJobParams {
        target: target.to_owned(),
        task: task.to_owned(),
        dispatched_by: "main".to_owned(),
        ..Default::default()
    }
}

/// Drive a job's execution status to a terminal value directly, standing in
/// for the worker + hooks.
async fn force_status(pool: &sqlx::PgPool, job_id: &str, to: JobStatus) {
    sqlx::query("UPDATE jobs SET status = $1 WHERE id = $2")
        .bind(to)
        .bind(job_id)
        .execute(pool)
        .await
        .expect("force status");
}

#[tokio::test]
async fn parent_unlocks_when_all_dependencies_complete() {
    let h = Harness::start().await;

    let dep_a = h.tracker.create_job(job("jarvis", "step 1a")).await.unwrap();
    let dep_b = h.tracker.create_job(job("jarvis", "step 1b")).await.unwrap();

    let mut parent = job("jarvis", "step 2");
    parent.depends_on = vec![dep_a.clone(), dep_b.clone()];
    let parent_id = h.tracker.create_job(parent).await.unwrap();

    // The parent is born blocked with one gate per dependency.
    let record = job_db::get_job(&h.pool, &parent_id).await.unwrap().unwrap();
    assert_eq!(record.launch_state, LaunchState::WaitingDeps);
    let gates = gate_db::gates_for_parent(&h.pool, &parent_id).await.unwrap();
    assert_eq!(gates.len(), 2);

    // First dependency completes: the parent stays blocked.
    force_status(&h.pool, &dep_a, JobStatus::Completed).await;
    wait_until("first gate completes", || async {
        gate_db::gates_for_parent(&h.pool, &parent_id)
            .await
            .unwrap()
            .iter()
            .any(|g| g.state == GateState::Completed)
    })
    .await;
    let record = job_db::get_job(&h.pool, &parent_id).await.unwrap().unwrap();
    assert_eq!(
        record.launch_state,
        LaunchState::WaitingDeps,
        "one completed gate must not unlock the parent"
    );

    // Second dependency completes: the parent unlocks.
    force_status(&h.pool, &dep_b, JobStatus::Completed).await;
    wait_until("parent unlocks", || async {
        matches!(
            job_db::get_job(&h.pool, &parent_id).await.unwrap(),
            Some(job) if job.launch_state == LaunchState::Queued
        )
    })
    .await;

    h.finish().await;
}

#[tokio::test]
async fn failed_dependency_blocks_parent_permanently() {
    let h = Harness::start().await;

    let dep = h.tracker.create_job(job("jarvis", "step 1")).await.unwrap();
    let mut parent = job("jarvis", "step 2");
    parent.depends_on = vec![dep.clone()];
    let parent_id = h.tracker.create_job(parent).await.unwrap();

    // The dependency fails terminally.
    force_status(&h.pool, &dep, JobStatus::FailedPermanent).await;

    wait_until("gate fails fast", || async {
        gate_db::gates_for_parent(&h.pool, &parent_id)
            .await
            .unwrap()
            .iter()
            .any(|g| g.state == GateState::Failed)
    })
    .await;

    // The parent never reaches a launchable state.
    let record = job_db::get_job(&h.pool, &parent_id).await.unwrap().unwrap();
    assert_eq!(record.launch_state, LaunchState::WaitingDeps);
    assert_eq!(record.status, JobStatus::Queued);

    let gates = gate_db::gates_for_parent(&h.pool, &parent_id).await.unwrap();
    assert!(
        gates[0]
            .error
            .as_deref()
            .unwrap_or("")
            .contains("failed"),
        "gate error should name the failure: {:?}",
        gates[0].error
    );

    h.finish().await;
}

#[tokio::test]
async fn missing_dependency_rejected_at_creation() {
    let h = Harness::start().await;

    let mut parent = job("jarvis", "step 2");
    parent.depends_on = vec!["no-such-job".to_owned()];
    let result = h.tracker.create_job(parent).await;

    let err = result.expect_err("missing dependency must fail creation");
    assert!(
        err.to_string().contains("no-such-job"),
        "error should name the missing dependency: {err}"
    );

    h.finish().await;
}

#[tokio::test]
async fn vanished_dependency_fails_gate() {
    let h = Harness::start().await;

    let dep = h.tracker.create_job(job("jarvis", "step 1")).await.unwrap();
    let mut parent = job("jarvis", "step 2");
    parent.depends_on = vec![dep.clone()];
    let parent_id = h.tracker.create_job(parent).await.unwrap();

    // The dependency record disappears (e.g. retention pruning).
    sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(&dep)
        .execute(&h.pool)
        .await
        .unwrap();

    wait_until("gate fails on missing dependency", || async {
        gate_db::gates_for_parent(&h.pool, &parent_id)
            .await
            .unwrap()
            .iter()
            .any(|g| g.state == GateState::Failed)
    })
    .await;

    h.finish().await;
}
