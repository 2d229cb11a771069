//! Integration tests for the jobs table: idempotent creation, the
//! claim/lease cycle, stalled reclaim, recovery, retention, and the
//! rate-limit window.

use steward_db::models::{JobStatus, LaunchState};
use steward_db::queries::jobs::{self as db, JobFilter, NewJob};
use steward_db::queries::rate_limits;
use steward_test_utils::TestDb;

fn job(id: &str, target: &str) -> NewJob {
    NewJob::queued(id.into(), target.into(), "do the thing".into(), "main".into())
}

#[tokio::test]
async fn insert_is_idempotent_on_job_id() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    assert!(db::insert_job(&pool, &job("j1", "jarvis")).await.unwrap());
    assert!(
        !db::insert_job(&pool, &job("j1", "jarvis")).await.unwrap(),
        "second insert with the same id must be a no-op"
    );

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 1);

    test_db.close().await;
}

#[tokio::test]
async fn claim_is_fifo_per_target() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    db::insert_job(&pool, &job("first", "jarvis")).await.unwrap();
    db::insert_job(&pool, &job("second", "jarvis")).await.unwrap();
    db::insert_job(&pool, &job("other", "iris")).await.unwrap();

    let claimed = db::claim_next_job(&pool, "jarvis", 300.0)
        .await
        .unwrap()
        .expect("a job should be claimable");
    assert_eq!(claimed.id, "first");
    assert_eq!(claimed.launch_state, LaunchState::Launching);
    assert!(claimed.lock_expires_at.is_some());

    // The second claim skips the locked job and other targets.
    let claimed = db::claim_next_job(&pool, "jarvis", 300.0)
        .await
        .unwrap()
        .expect("second job should be claimable");
    assert_eq!(claimed.id, "second");

    assert!(
        db::claim_next_job(&pool, "jarvis", 300.0)
            .await
            .unwrap()
            .is_none(),
        "nothing left to claim"
    );

    test_db.close().await;
}

#[tokio::test]
async fn delayed_jobs_become_claimable_after_run_at() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    let mut delayed = job("later", "jarvis");
    delayed.launch_state = LaunchState::Delayed;
    delayed.run_at = Some(chrono::Utc::now() + chrono::TimeDelta::milliseconds(300));
    db::insert_job(&pool, &delayed).await.unwrap();

    assert!(
        db::claim_next_job(&pool, "jarvis", 300.0)
            .await
            .unwrap()
            .is_none(),
        "not claimable before run_at"
    );

    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let claimed = db::claim_next_job(&pool, "jarvis", 300.0).await.unwrap();
    assert!(claimed.is_some(), "claimable after run_at");

    test_db.close().await;
}

#[tokio::test]
async fn expired_lock_is_reclaimed_with_stall_accounting() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    db::insert_job(&pool, &job("sticky", "jarvis")).await.unwrap();

    // First claim with a tiny lock.
    let claimed = db::claim_next_job(&pool, "jarvis", 0.05).await.unwrap().unwrap();
    assert_eq!(claimed.stalled_count, 0);

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    // The stall sweep flags it, then the reclaim picks it back up.
    assert_eq!(db::sweep_stalled(&pool).await.unwrap(), 1);
    let flagged = db::get_job(&pool, "sticky").await.unwrap().unwrap();
    assert_eq!(flagged.status, JobStatus::Stalled);

    let reclaimed = db::claim_next_job(&pool, "jarvis", 300.0).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, "sticky");
    assert_eq!(reclaimed.stalled_count, 1, "reclaim increments the counter");
    assert_eq!(reclaimed.status, JobStatus::Queued, "stalled flag cleared");

    test_db.close().await;
}

#[tokio::test]
async fn launch_retry_and_dead_letter_cycle() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    db::insert_job(&pool, &job("flaky", "jarvis")).await.unwrap();

    let claimed = db::claim_next_job(&pool, "jarvis", 300.0).await.unwrap().unwrap();
    assert_eq!(db::requeue_launch(&pool, &claimed.id, 0.01).await.unwrap(), 1);

    let j = db::get_job(&pool, "flaky").await.unwrap().unwrap();
    assert_eq!(j.launch_state, LaunchState::Delayed);
    assert_eq!(j.launch_attempts, 1);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let claimed = db::claim_next_job(&pool, "jarvis", 300.0).await.unwrap().unwrap();
    assert_eq!(db::dead_letter_job(&pool, &claimed.id, "gave up").await.unwrap(), 1);

    let j = db::get_job(&pool, "flaky").await.unwrap().unwrap();
    assert_eq!(j.launch_state, LaunchState::DeadLetter);
    assert_eq!(j.status, JobStatus::Failed);
    assert_eq!(j.error.as_deref(), Some("gave up"));
    assert!(j.completed_at.is_some());

    test_db.close().await;
}

#[tokio::test]
async fn transition_is_optimistic_under_concurrency() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    db::insert_job(&pool, &job("contested", "jarvis")).await.unwrap();
    db::mark_job_active(&pool, "contested", "run-1", "agent:jarvis:subagent:k")
        .await
        .unwrap();

    // Two concurrent completion attempts: exactly one row update wins.
    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let (a, b) = tokio::join!(
        db::transition_job_status(
            &pool_a,
            "contested",
            JobStatus::Active,
            JobStatus::Completed,
            None,
            None,
            true
        ),
        db::transition_job_status(
            &pool_b,
            "contested",
            JobStatus::Active,
            JobStatus::Failed,
            Some("raced"),
            None,
            true
        ),
    );
    assert_eq!(
        a.unwrap() + b.unwrap(),
        1,
        "exactly one concurrent transition may apply"
    );

    test_db.close().await;
}

#[tokio::test]
async fn session_key_lookup_prefers_live_record() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    // A terminal record and a live record under the same session key
    // (allowed by the partial unique index).
    let mut old = job("old", "jarvis");
    old.status = JobStatus::Queued;
    old.host_session_key = Some("agent:jarvis:subagent:dup".into());
    db::insert_job(&pool, &old).await.unwrap();
    sqlx::query("UPDATE jobs SET status = 'completed' WHERE id = 'old'")
        .execute(&pool)
        .await
        .unwrap();

    let mut live = job("live", "jarvis");
    live.host_session_key = Some("agent:jarvis:subagent:dup".into());
    db::insert_job(&pool, &live).await.unwrap();

    let found = db::find_job_by_session_key(&pool, "agent:jarvis:subagent:dup")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, "live");

    test_db.close().await;
}

#[tokio::test]
async fn queue_depth_and_drain() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    for i in 0..4 {
        db::insert_job(&pool, &job(&format!("j{i}"), "jarvis")).await.unwrap();
    }
    // One is mid-launch; still counts toward depth.
    db::claim_next_job(&pool, "jarvis", 300.0).await.unwrap().unwrap();

    assert_eq!(db::queue_depth(&pool, "jarvis").await.unwrap(), 4);

    // Drain removes only unlaunched work.
    let removed = db::drain_queue(&pool, "jarvis").await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(db::queue_depth(&pool, "jarvis").await.unwrap(), 1);

    test_db.close().await;
}

#[tokio::test]
async fn list_jobs_visibility_filter() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    let mut mine = job("mine", "jarvis");
    mine.dispatched_by = "iris".into();
    db::insert_job(&pool, &mine).await.unwrap();

    let mut toward_me = job("toward-me", "iris");
    toward_me.dispatched_by = "main".into();
    db::insert_job(&pool, &toward_me).await.unwrap();

    db::insert_job(&pool, &job("unrelated", "jarvis")).await.unwrap();

    let filter = JobFilter {
        dispatched_by_or_target: Some("iris"),
        limit: 50,
        ..Default::default()
    };
    let visible = db::list_jobs(&pool, &filter).await.unwrap();
    let ids: Vec<&str> = visible.iter().map(|j| j.id.as_str()).collect();
    assert!(ids.contains(&"mine"));
    assert!(ids.contains(&"toward-me"));
    assert!(!ids.contains(&"unrelated"));

    test_db.close().await;
}

#[tokio::test]
async fn retention_prunes_old_terminal_jobs() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    db::insert_job(&pool, &job("ancient", "jarvis")).await.unwrap();
    sqlx::query(
        "UPDATE jobs SET status = 'completed', completed_at = NOW() - INTERVAL '30 days' \
         WHERE id = 'ancient'",
    )
    .execute(&pool)
    .await
    .unwrap();

    db::insert_job(&pool, &job("fresh", "jarvis")).await.unwrap();
    sqlx::query("UPDATE jobs SET status = 'completed', completed_at = NOW() WHERE id = 'fresh'")
        .execute(&pool)
        .await
        .unwrap();

    let pruned = db::prune_terminal_jobs(&pool, 7.0, 1_000, 30.0, 5_000).await.unwrap();
    assert_eq!(pruned, 1);
    assert!(db::get_job(&pool, "ancient").await.unwrap().is_none());
    assert!(db::get_job(&pool, "fresh").await.unwrap().is_some());

    test_db.close().await;
}

#[tokio::test]
async fn rate_limit_window_counts_and_resets() {
    let test_db = TestDb::new().await;
    let pool = test_db.pool().clone();

    for expected in 1..=3 {
        let count = rate_limits::increment_dispatch_count(&pool, "iris").await.unwrap();
        assert_eq!(count, expected);
    }

    // Another caller has an independent window.
    assert_eq!(
        rate_limits::increment_dispatch_count(&pool, "main").await.unwrap(),
        1
    );

    // Age the window out; the same statement resets it.
    sqlx::query(
        "UPDATE dispatch_rate SET window_start = NOW() - INTERVAL '2 minutes' \
         WHERE caller_id = 'iris'",
    )
    .execute(&pool)
    .await
    .unwrap();
    assert_eq!(
        rate_limits::increment_dispatch_count(&pool, "iris").await.unwrap(),
        1,
        "a rolled-over window restarts at 1"
    );

    test_db.close().await;
}
