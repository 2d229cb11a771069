//! Integration tests for the read tools: visibility rules, session-key
//! stripping, dependency reporting, and the activity overview.

mod common;

use std::sync::Arc;

use steward_core::dispatch::ToolStatus;
use steward_core::learning::{self, AddLearningParams, LearningsParams};
use steward_core::query::{self, ListParams};
use steward_core::tracker::{CreateJobParams, JobTracker};
use steward_db::queries::jobs as job_db;
use steward_test_utils::TestDb;

use common::test_config;

struct Harness {
    db: TestDb,
    pool: sqlx::PgPool,
    config: steward_core::config::OrchestratorConfig,
    tracker: JobTracker,
}

impl Harness {
    async fn new() -> Self {
        let db = TestDb::new().await;
        let pool = db.pool().clone();
        let config = test_config();
        let tracker = JobTracker::new(pool.clone(), Arc::new(config.clone()));
        Self {
            db,
            pool,
            config,
            tracker,
        }
    }

    async fn seed_job(&self, target: &str, dispatched_by: &str, task: &str) -> String {
        self.tracker
            .create_job(CreateJobParams {
                target: target.to_owned(),
                task: task.to_owned(),
                dispatched_by: dispatched_by.to_owned(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn finish(self) {
        self.db.close().await;
    }
}

#[tokio::test]
async fn status_enforces_visibility() {
    let h = Harness::new().await;
    let job_id = h.seed_job("jarvis", "iris", "secret work").await;

    // Dispatcher and target see the job.
    for caller in ["iris", "jarvis"] {
        let reply = query::status(&h.pool, &h.config, caller, &job_id).await;
        assert_eq!(reply.status, ToolStatus::Ok, "{caller} should see the job");
    }

    // A third party gets not-found, not forbidden: existence must not leak.
    let reply = query::status(&h.pool, &h.config, "visitor", &job_id).await;
    assert_eq!(reply.status, ToolStatus::NotFound);

    // A system agent sees everything.
    let reply = query::status(&h.pool, &h.config, "main", &job_id).await;
    assert_eq!(reply.status, ToolStatus::Ok);

    h.finish().await;
}

#[tokio::test]
async fn session_key_stripped_for_non_system_callers() {
    let h = Harness::new().await;
    let job_id = h.seed_job("jarvis", "iris", "keyed work").await;
    job_db::mark_job_active(&h.pool, &job_id, "run-1", "agent:jarvis:subagent:abc")
        .await
        .unwrap();

    let reply = query::status(&h.pool, &h.config, "iris", &job_id).await;
    let view = reply.job.unwrap();
    assert_eq!(view.session_key, None, "non-system callers never see the key");

    let reply = query::status(&h.pool, &h.config, "main", &job_id).await;
    let view = reply.job.unwrap();
    assert_eq!(
        view.session_key.as_deref(),
        Some("agent:jarvis:subagent:abc"),
        "system agents see the linkage"
    );

    h.finish().await;
}

#[tokio::test]
async fn status_reports_waiting_for_dependencies() {
    let h = Harness::new().await;
    let dep = h.seed_job("jarvis", "main", "step 1").await;

    let parent_id = h
        .tracker
        .create_job(CreateJobParams {
            target: "jarvis".to_owned(),
            task: "step 2".to_owned(),
            dispatched_by: "main".to_owned(),
            depends_on: vec![dep.clone()],
            ..Default::default()
        })
        .await
        .unwrap();

    let reply = query::status(&h.pool, &h.config, "main", &parent_id).await;
    let view = reply.job.unwrap();
    assert_eq!(view.waiting_for_dependencies, Some(true));

    // A plain job reports nothing.
    let reply = query::status(&h.pool, &h.config, "main", &dep).await;
    assert_eq!(reply.job.unwrap().waiting_for_dependencies, None);

    h.finish().await;
}

#[tokio::test]
async fn list_scopes_and_filters() {
    let h = Harness::new().await;
    h.seed_job("jarvis", "iris", "iris job").await;
    h.seed_job("jarvis", "main", "main job").await;
    let failed_id = h.seed_job("iris", "main", "doomed").await;
    sqlx::query("UPDATE jobs SET status = 'failed' WHERE id = $1")
        .bind(&failed_id)
        .execute(&h.pool)
        .await
        .unwrap();

    // visitor sees nothing.
    let reply = query::list(&h.pool, &h.config, "visitor", ListParams::default()).await;
    assert_eq!(reply.count, 0);

    // iris sees jobs it dispatched or is the target of.
    let reply = query::list(&h.pool, &h.config, "iris", ListParams::default()).await;
    assert_eq!(reply.count, 2);

    // System agent sees all three; the failed filter narrows to one.
    let reply = query::list(&h.pool, &h.config, "main", ListParams::default()).await;
    assert_eq!(reply.count, 3);
    let reply = query::list(
        &h.pool,
        &h.config,
        "main",
        ListParams {
            status: Some("failed".to_owned()),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(reply.count, 1);
    assert_eq!(reply.jobs[0].job_id, failed_id);

    // Limit is clamped into 1..=100.
    let reply = query::list(
        &h.pool,
        &h.config,
        "main",
        ListParams {
            limit: Some(500),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(reply.limit, 100);

    h.finish().await;
}

#[tokio::test]
async fn activity_reports_fleet_state() {
    let h = Harness::new().await;

    let active_id = h.seed_job("jarvis", "main", "busy work").await;
    job_db::mark_job_active(&h.pool, &active_id, "run-1", "agent:jarvis:subagent:xyz")
        .await
        .unwrap();
    h.seed_job("iris", "main", "waiting work").await;

    let reply = query::activity(&h.pool, &h.config).await;
    assert_eq!(reply.status, ToolStatus::Ok);

    let jarvis = &reply.agents["jarvis"];
    assert_eq!(jarvis.status, "working");
    assert_eq!(jarvis.active, 1);
    assert!(jarvis.since.is_some());

    let iris = &reply.agents["iris"];
    assert_eq!(iris.status, "idle");
    assert_eq!(iris.pending, 1);

    assert!(reply.summary.contains("1 working"), "summary: {}", reply.summary);

    h.finish().await;
}

#[tokio::test]
async fn learning_tools_enforce_bounds_and_roles() {
    let h = Harness::new().await;
    let job_id = h.seed_job("jarvis", "main", "learnable").await;

    // Non-system callers may not write.
    let reply = learning::add_learning(
        &h.pool,
        &h.config,
        "iris",
        AddLearningParams {
            project_id: "proj".into(),
            job_id: job_id.clone(),
            learning: "water is wet".into(),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(reply.status, ToolStatus::Unauthorized);

    // Over-long learnings are rejected.
    let reply = learning::add_learning(
        &h.pool,
        &h.config,
        "main",
        AddLearningParams {
            project_id: "proj".into(),
            job_id: job_id.clone(),
            learning: "x".repeat(1_025),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(reply.status, ToolStatus::Error);

    // A valid write lands and reads back newest-first by project.
    for text in ["first lesson", "second lesson"] {
        let reply = learning::add_learning(
            &h.pool,
            &h.config,
            "main",
            AddLearningParams {
                project_id: "proj".into(),
                job_id: job_id.clone(),
                learning: text.into(),
                tags: vec!["ops".into()],
                ..Default::default()
            },
        )
        .await;
        assert_eq!(reply.status, ToolStatus::Ok);
    }

    let reply = learning::learnings(
        &h.pool,
        LearningsParams {
            project_id: Some("proj".into()),
            ..Default::default()
        },
    )
    .await;
    assert_eq!(reply.entries.len(), 2);
    assert_eq!(reply.entries[0].learning, "second lesson");

    // Tag filter.
    let reply = learning::learnings(
        &h.pool,
        LearningsParams {
            project_id: Some("proj".into()),
            tags: vec!["nope".into()],
            ..Default::default()
        },
    )
    .await;
    assert_eq!(reply.entries.len(), 0);

    // One of project_id/job_id is required.
    let reply = learning::learnings(&h.pool, LearningsParams::default()).await;
    assert_eq!(reply.status, ToolStatus::Error);

    h.finish().await;
}
