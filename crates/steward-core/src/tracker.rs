//! The job tracker: owns job creation (including dependency flows), status
//! updates, index lookups, queue statistics, and the periodic stale-entry
//! cleanup.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use steward_db::models::{CleanupMode, JobRecord, JobStatus, LaunchState};
use steward_db::queries::jobs::{self as job_db, NewJob, QueueStats};
use steward_db::queries::{approvals as approval_db, gates as gate_db, learnings as learning_db};
use steward_db::queries::rate_limits as rate_db;

use crate::config::OrchestratorConfig;

/// Parameters accepted by [`JobTracker::create_job`].
#[derive(Debug, Clone, Default)]
pub struct CreateJobParams {
    /// Explicit job id (idempotency key); a fresh UUID when absent.
    pub job_id: Option<String>,
    pub target: String,
    pub task: String,
    pub dispatched_by: String,
    pub project: Option<String>,
    pub label: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub system_prompt_addition: Option<String>,
    pub cleanup: CleanupMode,
    pub depth: i32,
    pub depends_on: Vec<String>,
    pub dispatcher_session_key: Option<String>,
    pub dispatcher_depth: Option<i32>,
    pub dispatcher_channel: Option<String>,
    pub dispatcher_account_id: Option<String>,
    pub dispatcher_to: Option<String>,
    pub dispatcher_thread_id: Option<String>,
    pub timeout_seconds: Option<i32>,
    pub store_result: bool,
    /// Retry-chain linkage; set only by the agent-level retry path.
    pub retry_count: i32,
    pub original_job_id: Option<String>,
    /// Earliest launch time (retry backoff).
    pub run_at: Option<DateTime<Utc>>,
}

/// Result of one stale-entry cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub jobs_pruned: u64,
    pub gates_pruned: u64,
    pub approvals_expired: u64,
    pub learnings_expired: u64,
    pub rate_windows_dropped: u64,
}

/// The tracker. Cheap to clone behind an `Arc`.
pub struct JobTracker {
    pool: PgPool,
    config: Arc<OrchestratorConfig>,
}

impl JobTracker {
    pub fn new(pool: PgPool, config: Arc<OrchestratorConfig>) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Canonical display name for an agent's queue.
    pub fn queue_name(agent_id: &str) -> String {
        format!("agent-{agent_id}")
    }

    /// Create a job. Returns the job id.
    ///
    /// With an empty `depends_on` this is a single idempotent insert. With
    /// dependencies, every referenced job must exist; the parent is then
    /// written in `waiting_deps` together with one gate per dependency, all
    /// in one transaction, and stays blocked until every gate completes.
    pub async fn create_job(&self, params: CreateJobParams) -> Result<String> {
        let job_id = params
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let has_deps = !params.depends_on.is_empty();
        if has_deps {
            for dep_id in &params.depends_on {
                if job_db::get_job(&self.pool, dep_id).await?.is_none() {
                    bail!("dependency job {dep_id} not found");
                }
            }
        }

        let new_job = NewJob {
            id: job_id.clone(),
            original_job_id: params.original_job_id.clone(),
            target: params.target.clone(),
            task: params.task.clone(),
            dispatched_by: params.dispatched_by.clone(),
            project: params.project.clone(),
            label: params.label.clone(),
            model: params.model.clone(),
            thinking_level: params.thinking_level.clone(),
            system_prompt_addition: params.system_prompt_addition.clone(),
            cleanup: params.cleanup.to_string(),
            depth: params.depth,
            dispatcher_session_key: params.dispatcher_session_key.clone(),
            dispatcher_depth: params.dispatcher_depth,
            dispatcher_channel: params.dispatcher_channel.clone(),
            dispatcher_account_id: params.dispatcher_account_id.clone(),
            dispatcher_to: params.dispatcher_to.clone(),
            dispatcher_thread_id: params.dispatcher_thread_id.clone(),
            timeout_seconds: params.timeout_seconds,
            retry_count: params.retry_count,
            store_result: params.store_result,
            launch_state: if has_deps {
                LaunchState::WaitingDeps
            } else if params.run_at.is_some() {
                LaunchState::Delayed
            } else {
                LaunchState::Queued
            },
            status: JobStatus::Queued,
            run_at: params.run_at,
            host_run_id: None,
            host_session_key: None,
        };

        if !has_deps {
            let inserted = job_db::insert_job(&self.pool, &new_job).await?;
            if !inserted {
                tracing::debug!(job_id = %job_id, "job already exists, create is a no-op");
            }
            return Ok(job_id);
        }

        let mut tx = self.pool.begin().await.context("failed to begin flow")?;
        let inserted = job_db::insert_job(&mut *tx, &new_job).await?;
        if !inserted {
            // The flow (parent + gates) was created by an earlier call.
            tx.rollback().await.ok();
            return Ok(job_id);
        }
        for dep_id in &params.depends_on {
            gate_db::insert_gate(&mut *tx, &job_id, dep_id, &params.target).await?;
        }
        tx.commit().await.context("failed to commit flow")?;

        tracing::info!(
            job_id = %job_id,
            target = %params.target,
            gates = params.depends_on.len(),
            "created dependency flow"
        );

        Ok(job_id)
    }

    /// Update a job's execution status through the state machine
    /// (optimistic on the current status).
    pub async fn update_job_status(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
        result: Option<&str>,
    ) -> Result<()> {
        crate::state::JobStateMachine::transition(&self.pool, job_id, from, to, error, result)
            .await
    }

    /// O(1) lookup by job id (the id doubles as the host run id for jobs
    /// tracked via the compatibility hook).
    pub async fn find_job_by_run_id(&self, job_id: &str) -> Result<Option<JobRecord>> {
        job_db::get_job(&self.pool, job_id).await
    }

    /// O(1) lookup through the session-key reverse index.
    pub async fn find_job_by_session_key(&self, session_key: &str) -> Result<Option<JobRecord>> {
        job_db::find_job_by_session_key(&self.pool, session_key).await
    }

    /// Write the session-key reverse index entry for a job.
    pub async fn index_job_by_session_key(&self, job_id: &str, session_key: &str) -> Result<()> {
        let rows = job_db::index_job_by_session_key(&self.pool, job_id, session_key).await?;
        if rows == 0 {
            bail!("job {job_id} not found");
        }
        Ok(())
    }

    /// Per-queue counters for one agent, or for every configured agent and
    /// every queue that still holds jobs.
    pub async fn queue_stats(&self, agent_id: Option<&str>) -> Result<Vec<(String, QueueStats)>> {
        let targets: Vec<String> = match agent_id {
            Some(id) => vec![id.to_owned()],
            None => {
                let mut ids: Vec<String> =
                    self.config.agents.iter().map(|a| a.id.clone()).collect();
                for known in job_db::known_targets(&self.pool).await? {
                    if !ids.contains(&known) {
                        ids.push(known);
                    }
                }
                ids
            }
        };

        let mut stats = Vec::with_capacity(targets.len());
        for target in targets {
            let s = job_db::queue_stats(&self.pool, &target).await?;
            stats.push((Self::queue_name(&target), s));
        }
        Ok(stats)
    }

    /// Stale-entry cleanup: orphaned gates (batches of 50), expired
    /// approvals and learnings, rolled-over rate windows, and terminal jobs
    /// past retention. Failures are the caller's to log and swallow; this
    /// runs on a non-blocking periodic schedule.
    pub async fn cleanup_stale_entries(&self) -> Result<CleanupReport> {
        let tuning = &self.config.queue;

        let gates_pruned = gate_db::prune_orphaned_gates(&self.pool, 50).await?;
        let approvals_expired = approval_db::sweep_expired(&self.pool).await?;
        let learnings_expired = learning_db::sweep_expired(&self.pool).await?;
        let rate_windows_dropped = rate_db::sweep_stale_windows(&self.pool).await?;
        let jobs_pruned = job_db::prune_terminal_jobs(
            &self.pool,
            tuning.completed_retention_days,
            tuning.completed_keep,
            tuning.failed_retention_days,
            tuning.failed_keep,
        )
        .await?;

        Ok(CleanupReport {
            jobs_pruned,
            gates_pruned,
            approvals_expired,
            learnings_expired,
            rate_windows_dropped,
        })
    }
}
