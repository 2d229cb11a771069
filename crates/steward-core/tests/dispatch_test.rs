//! Integration tests for the dispatch tool: validation boundaries,
//! authorization, approval routing, rate limiting, queue-depth caps, and
//! the direct-spawn fallback.

mod common;

use std::sync::Arc;
use std::time::Duration;

use steward_core::breaker::CircuitBreaker;
use steward_core::dispatch::{self, DispatchDeps, DispatchParams, ToolStatus};
use steward_core::tracker::JobTracker;
use steward_db::models::{ApprovalStatus, JobStatus, LaunchState};
use steward_db::queries::{approvals as approval_db, jobs as job_db};
use steward_test_utils::TestDb;

use common::{MockHost, MockSender, test_config};

struct Harness {
    db: TestDb,
    pool: sqlx::PgPool,
    config: steward_core::config::OrchestratorConfig,
    host: MockHost,
    sender: MockSender,
    breaker: CircuitBreaker,
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
            host: MockHost::new(),
            sender: MockSender::new(),
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
            tracker,
        }
    }

    fn deps(&self) -> DispatchDeps<'_> {
        DispatchDeps {
            config: &self.config,
            host: &self.host,
            sender: &self.sender,
            breaker: &self.breaker,
            tracker: Some(&self.tracker),
        }
    }

    fn deps_without_store(&self) -> DispatchDeps<'_> {
        DispatchDeps {
            config: &self.config,
            host: &self.host,
            sender: &self.sender,
            breaker: &self.breaker,
            tracker: None,
        }
    }

    async fn finish(self) {
        self.db.close().await;
    }
}

fn params(target: &str, task: &str) -> DispatchParams {
    DispatchParams {
        target: target.to_owned(),
        task: task.to_owned(),
        ..Default::default()
    }
}

#[tokio::test]
async fn orchestrator_dispatch_queues_job() {
    let h = Harness::new().await;

    let reply = dispatch::dispatch(&h.deps(), "main", params("jarvis", "echo hello")).await;
    assert_eq!(reply.status, ToolStatus::Queued);
    assert_eq!(reply.target.as_deref(), Some("jarvis"));
    let job_id = reply.job_id.expect("job id");

    let job = job_db::get_job(&h.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.launch_state, LaunchState::Queued);
    assert_eq!(job.dispatched_by, "main");

    h.finish().await;
}

#[tokio::test]
async fn task_length_boundary() {
    let h = Harness::new().await;

    // Exactly 50 000 characters is accepted.
    let reply = dispatch::dispatch(&h.deps(), "main", params("jarvis", &"x".repeat(50_000))).await;
    assert_eq!(reply.status, ToolStatus::Queued);

    // 50 001 is rejected.
    let reply = dispatch::dispatch(&h.deps(), "main", params("jarvis", &"x".repeat(50_001))).await;
    assert_eq!(reply.status, ToolStatus::Error);
    assert!(
        reply.error.as_deref().unwrap_or("").contains("50000"),
        "error should cite the limit: {:?}",
        reply.error
    );

    h.finish().await;
}

#[tokio::test]
async fn depends_on_boundary() {
    let h = Harness::new().await;

    // Seed 21 jobs to reference.
    let mut dep_ids = Vec::new();
    for i in 0..21 {
        let reply = dispatch::dispatch(&h.deps(), "main", params("jarvis", &format!("dep {i}"))).await;
        dep_ids.push(reply.job_id.unwrap());
    }

    // 20 dependencies accepted.
    let mut p = params("jarvis", "chained");
    p.depends_on = dep_ids[..20].to_vec();
    let reply = dispatch::dispatch(&h.deps(), "main", p).await;
    assert_eq!(reply.status, ToolStatus::Queued);

    // 21 rejected.
    let mut p = params("jarvis", "over-chained");
    p.depends_on = dep_ids.clone();
    let reply = dispatch::dispatch(&h.deps(), "main", p).await;
    assert_eq!(reply.status, ToolStatus::Error);

    h.finish().await;
}

#[tokio::test]
async fn unknown_dependency_is_not_found() {
    let h = Harness::new().await;

    let mut p = params("jarvis", "chained");
    p.depends_on = vec!["ghost-job".to_owned()];
    let reply = dispatch::dispatch(&h.deps(), "main", p).await;
    assert_eq!(reply.status, ToolStatus::NotFound);

    h.finish().await;
}

#[tokio::test]
async fn allowlist_and_privilege_rejections() {
    let h = Harness::new().await;

    // iris may only dispatch to jarvis.
    let reply = dispatch::dispatch(&h.deps(), "iris", params("main", "nope")).await;
    assert_eq!(reply.status, ToolStatus::Forbidden);

    // Unknown target.
    let reply = dispatch::dispatch(&h.deps(), "main", params("nobody", "hi")).await;
    assert_eq!(reply.status, ToolStatus::Error);

    // system_prompt_addition is restricted to system agents.
    let mut p = params("jarvis", "hello");
    p.system_prompt_addition = Some("be evil".to_owned());
    let reply = dispatch::dispatch(&h.deps(), "iris", p.clone()).await;
    assert_eq!(reply.status, ToolStatus::Forbidden);

    // A system agent may use it.
    let reply = dispatch::dispatch(&h.deps(), "main", p).await;
    assert_eq!(reply.status, ToolStatus::Queued);

    h.finish().await;
}

#[tokio::test]
async fn non_orchestrator_routes_through_approval() {
    let h = Harness::new().await;

    let reply = dispatch::dispatch(&h.deps(), "visitor", params("jarvis", "delete logs")).await;
    assert_eq!(reply.status, ToolStatus::PendingApproval);
    let approval_id: uuid::Uuid = reply.job_id.unwrap().parse().expect("approval UUID");

    // The record is pending with the full task, and the notification was
    // sent before it was written.
    let record = approval_db::get_approval(&h.pool, approval_id)
        .await
        .unwrap()
        .expect("approval record");
    assert_eq!(record.status, ApprovalStatus::Pending);
    assert_eq!(record.task, "delete logs");
    assert!(record.notification_message_id.is_some());

    assert_eq!(h.sender.sent_count(), 1);
    let sent = h.sender.last_sent().unwrap();
    assert_eq!(sent.channel, "C-approvals");
    assert!(sent.content.contains("visitor"));

    // No job was enqueued.
    assert_eq!(job_db::queue_depth(&h.pool, "jarvis").await.unwrap(), 0);

    h.finish().await;
}

#[tokio::test]
async fn notification_failure_creates_no_orphan_record() {
    let h = Harness::new().await;
    h.sender
        .fail_send
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let reply = dispatch::dispatch(&h.deps(), "visitor", params("jarvis", "delete logs")).await;
    assert_eq!(reply.status, ToolStatus::Error);

    let pending = approval_db::list_pending(&h.pool, 10).await.unwrap();
    assert!(pending.is_empty(), "no orphan approval may exist");

    h.finish().await;
}

#[tokio::test]
async fn approval_without_channel_is_rejected() {
    let mut h = Harness::new().await;
    h.config.approval.channel_id = None;

    let reply = dispatch::dispatch(&h.deps(), "visitor", params("jarvis", "task")).await;
    assert_eq!(reply.status, ToolStatus::Error);
    assert!(
        reply.error.as_deref().unwrap_or("").contains("channel"),
        "error should mention the missing channel: {:?}",
        reply.error
    );

    h.finish().await;
}

#[tokio::test]
async fn rate_limit_boundary_and_message() {
    let h = Harness::new().await;

    // The configured limit is 10/min; the 10th is accepted, the 11th is
    // rejected with the exact counter in the message.
    for i in 0..10 {
        let reply = dispatch::dispatch(&h.deps(), "iris", params("jarvis", &format!("job {i}"))).await;
        assert_eq!(reply.status, ToolStatus::Queued, "dispatch {i} should pass");
    }
    let reply = dispatch::dispatch(&h.deps(), "iris", params("jarvis", "one too many")).await;
    assert_eq!(reply.status, ToolStatus::RateLimited);
    assert_eq!(
        reply.error.as_deref(),
        Some("Rate limit exceeded: 11/10 dispatches this minute")
    );

    h.finish().await;
}

#[tokio::test]
async fn queue_depth_cap() {
    let mut h = Harness::new().await;
    h.config.rate_limit.max_queue_depth = 3;
    h.config.rate_limit.dispatches_per_minute = 0; // out of the way

    for i in 0..3 {
        let reply = dispatch::dispatch(&h.deps(), "main", params("jarvis", &format!("job {i}"))).await;
        assert_eq!(reply.status, ToolStatus::Queued, "dispatch {i} should pass");
    }
    let reply = dispatch::dispatch(&h.deps(), "main", params("jarvis", "overflow")).await;
    assert_eq!(reply.status, ToolStatus::QueueFull);

    h.finish().await;
}

#[tokio::test]
async fn store_unreachable_uses_direct_fallback() {
    let h = Harness::new().await;

    let reply = dispatch::dispatch(&h.deps_without_store(), "main", params("jarvis", "urgent")).await;
    assert_eq!(reply.status, ToolStatus::Dispatched);
    assert_eq!(reply.fallback, Some(true));
    assert!(reply.fallback_reason.is_some());
    let job_id = reply.job_id.unwrap();
    assert!(
        job_id.starts_with("fallback-"),
        "fallback ids are synthetic: {job_id}"
    );

    // The child really started, directly against the host.
    assert_eq!(h.host.started_count(), 1);

    h.finish().await;
}
