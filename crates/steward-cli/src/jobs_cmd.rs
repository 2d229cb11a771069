//! Job-level operator commands: list, inspect, retry, drain, and the
//! pending-approvals view.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use std::sync::Arc;

use steward_core::config::OrchestratorConfig;
use steward_core::text;
use steward_core::tracker::{CreateJobParams, JobTracker};
use steward_db::models::JobStatus;
use steward_db::queries::approvals as approval_db;
use steward_db::queries::jobs::{self as job_db, JobFilter};

fn status_classes(filter: &str) -> Result<Vec<JobStatus>> {
    Ok(match filter {
        "queued" => vec![JobStatus::Queued, JobStatus::Stalled],
        "active" => vec![JobStatus::Active, JobStatus::Announcing],
        "completed" => vec![JobStatus::Completed],
        "failed" => vec![
            JobStatus::Failed,
            JobStatus::FailedPermanent,
            JobStatus::Retrying,
        ],
        other => bail!("unknown status filter: {other:?}"),
    })
}

pub async fn run_list(
    pool: &PgPool,
    agent: Option<&str>,
    status: Option<&str>,
    limit: i64,
) -> Result<()> {
    let statuses = status.map(status_classes).transpose()?;
    let filter = JobFilter {
        target: agent,
        statuses: statuses.as_deref(),
        project: None,
        dispatched_by_or_target: None,
        limit: limit.clamp(1, 100),
    };
    let jobs = job_db::list_jobs(pool, &filter).await?;

    if jobs.is_empty() {
        println!("no jobs found");
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!(
        "{:<38} {:<14} {:<16} {:<10} {:<10} TASK",
        "JOB", "TARGET", "STATUS", "QUEUED", "RETRIES"
    );
    for job in &jobs {
        println!(
            "{:<38} {:<14} {:<16} {:<10} {:<10} {}",
            job.id,
            job.target,
            job.status.to_string(),
            text::format_relative(job.queued_at, now),
            job.retry_count,
            text::truncate_with_ellipsis(&job.task.replace('\n', " "), 60),
        );
    }

    Ok(())
}

pub async fn run_inspect(pool: &PgPool, job_id: &str) -> Result<()> {
    let job = job_db::get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

/// Operator retry: re-enqueue a failed job under a new id, linking the
/// chain exactly like the agent-level retry path does.
pub async fn run_retry(pool: &PgPool, config: &OrchestratorConfig, job_id: &str) -> Result<()> {
    let job = job_db::get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    if job.status != JobStatus::Failed {
        bail!(
            "job {job_id} has status {}, only failed jobs can be retried",
            job.status
        );
    }

    let tracker = JobTracker::new(pool.clone(), Arc::new(config.clone()));
    let new_id = tracker
        .create_job(CreateJobParams {
            target: job.target.clone(),
            task: job.task.clone(),
            dispatched_by: job.dispatched_by.clone(),
            project: job.project.clone(),
            label: job.label.clone(),
            model: job.model.clone(),
            thinking_level: job.thinking_level.clone(),
            system_prompt_addition: job.system_prompt_addition.clone(),
            cleanup: job.cleanup,
            depth: job.depth,
            dispatcher_session_key: job.dispatcher_session_key.clone(),
            dispatcher_depth: job.dispatcher_depth,
            dispatcher_channel: job.dispatcher_channel.clone(),
            dispatcher_account_id: job.dispatcher_account_id.clone(),
            dispatcher_to: job.dispatcher_to.clone(),
            dispatcher_thread_id: job.dispatcher_thread_id.clone(),
            timeout_seconds: job.timeout_seconds,
            store_result: job.store_result,
            retry_count: job.retry_count + 1,
            original_job_id: Some(job.original_job_id.clone().unwrap_or_else(|| job.id.clone())),
            ..Default::default()
        })
        .await?;
    job_db::mark_retrying(pool, &job.id, &new_id).await?;

    println!("retrying {job_id} as {new_id}");
    Ok(())
}

pub async fn run_drain(pool: &PgPool, agent: &str, confirm: bool) -> Result<()> {
    if !confirm {
        bail!("drain discards all queued work for {agent}; pass --confirm to proceed");
    }
    let removed = job_db::drain_queue(pool, agent).await?;
    println!("drained {removed} jobs from agent-{agent}");
    Ok(())
}

pub async fn run_pending(pool: &PgPool, limit: i64) -> Result<()> {
    let pending = approval_db::list_pending(pool, limit.clamp(1, 100)).await?;

    if pending.is_empty() {
        println!("no pending approvals");
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!(
        "{:<10} {:<14} {:<14} {:<10} TASK",
        "ID", "CALLER", "TARGET", "AGE"
    );
    for approval in &pending {
        println!(
            "{:<10} {:<14} {:<14} {:<10} {}",
            &approval.id.to_string()[..8],
            approval.caller,
            approval.target,
            text::format_relative(approval.created_at, now),
            text::truncate_with_ellipsis(&approval.task.replace('\n', " "), 60),
        );
    }

    Ok(())
}
