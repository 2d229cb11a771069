//! Query functions for the `jobs` table: creation, the claim/lease cycle,
//! status transitions, recovery, and retention.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};

use crate::models::{JobRecord, JobStatus, LaunchState};

/// Parameters for inserting a new job.
///
/// Everything not listed here is server-defaulted (timestamps, counters).
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub id: String,
    pub original_job_id: Option<String>,
    pub target: String,
    pub task: String,
    pub dispatched_by: String,
    pub project: Option<String>,
    pub label: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub system_prompt_addition: Option<String>,
    pub cleanup: String,
    pub depth: i32,
    pub dispatcher_session_key: Option<String>,
    pub dispatcher_depth: Option<i32>,
    pub dispatcher_channel: Option<String>,
    pub dispatcher_account_id: Option<String>,
    pub dispatcher_to: Option<String>,
    pub dispatcher_thread_id: Option<String>,
    pub timeout_seconds: Option<i32>,
    pub retry_count: i32,
    pub store_result: bool,
    /// `queued` for plain jobs, `waiting_deps` for dependency-flow parents,
    /// `delayed` for retry jobs with a future `run_at`.
    pub launch_state: LaunchState,
    /// Initial execution status (`queued`, or `active` for tracking jobs
    /// created after the fact by the compatibility hook).
    pub status: JobStatus,
    pub run_at: Option<DateTime<Utc>>,
    pub host_run_id: Option<String>,
    pub host_session_key: Option<String>,
}

impl NewJob {
    /// A plain queued job with the given identity and routing.
    pub fn queued(id: String, target: String, task: String, dispatched_by: String) -> Self {
        Self {
            id,
            target,
            task,
            dispatched_by,
            cleanup: "keep".to_owned(),
            launch_state: LaunchState::Queued,
            status: JobStatus::Queued,
            ..Default::default()
        }
    }
}

/// Insert a job. Returns `true` if a row was created, `false` if a job with
/// this id already exists (`ON CONFLICT DO NOTHING` -- the job id is the
/// idempotency key).
pub async fn insert_job(executor: impl PgExecutor<'_>, job: &NewJob) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO jobs (id, original_job_id, target, task, dispatched_by, project, label, \
                           model, thinking_level, system_prompt_addition, cleanup, depth, \
                           dispatcher_session_key, dispatcher_depth, dispatcher_channel, \
                           dispatcher_account_id, dispatcher_to, dispatcher_thread_id, \
                           timeout_seconds, retry_count, store_result, launch_state, status, \
                           run_at, host_run_id, host_session_key) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
                 $18, $19, $20, $21, $22, $23, COALESCE($24, NOW()), $25, $26) \
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(&job.id)
    .bind(&job.original_job_id)
    .bind(&job.target)
    .bind(&job.task)
    .bind(&job.dispatched_by)
    .bind(&job.project)
    .bind(&job.label)
    .bind(&job.model)
    .bind(&job.thinking_level)
    .bind(&job.system_prompt_addition)
    .bind(&job.cleanup)
    .bind(job.depth)
    .bind(&job.dispatcher_session_key)
    .bind(job.dispatcher_depth)
    .bind(&job.dispatcher_channel)
    .bind(&job.dispatcher_account_id)
    .bind(&job.dispatcher_to)
    .bind(&job.dispatcher_thread_id)
    .bind(job.timeout_seconds)
    .bind(job.retry_count)
    .bind(job.store_result)
    .bind(job.launch_state)
    .bind(job.status)
    .bind(job.run_at)
    .bind(&job.host_run_id)
    .bind(&job.host_session_key)
    .execute(executor)
    .await
    .context("failed to insert job")?;

    Ok(result.rows_affected() > 0)
}

/// Fetch a single job by id.
pub async fn get_job(pool: &PgPool, id: &str) -> Result<Option<JobRecord>> {
    let job = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// Find the job a session key currently identifies.
///
/// The session-key index is unique over non-terminal jobs, so this resolves
/// to the live record; if only terminal records remain, the most recent wins.
pub async fn find_job_by_session_key(pool: &PgPool, session_key: &str) -> Result<Option<JobRecord>> {
    let job = sqlx::query_as::<_, JobRecord>(
        "SELECT * FROM jobs WHERE host_session_key = $1 \
         ORDER BY (status IN ('completed', 'failed_permanent', 'retrying')) ASC, queued_at DESC \
         LIMIT 1",
    )
    .bind(session_key)
    .fetch_optional(pool)
    .await
    .context("failed to find job by session key")?;

    Ok(job)
}

/// Atomically transition a job's execution status.
///
/// Optimistic locking: the UPDATE only applies when the current status
/// matches `from`. Returns the number of rows affected (0 means the status
/// did not match or the job does not exist).
pub async fn transition_job_status(
    pool: &PgPool,
    id: &str,
    from: JobStatus,
    to: JobStatus,
    error: Option<&str>,
    result: Option<&str>,
    set_completed_at: bool,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs \
         SET status = $1, \
             error = COALESCE($2, error), \
             result = COALESCE($3, result), \
             completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END \
         WHERE id = $5 AND status = $6",
    )
    .bind(to)
    .bind(error)
    .bind(result)
    .bind(set_completed_at)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition job status")?;

    Ok(res.rows_affected())
}

/// Write the session-host linkage and flip the job to `active`
/// (worker launch steps 12-13: linkage, started_at, session-key index).
pub async fn mark_job_active(
    pool: &PgPool,
    id: &str,
    host_run_id: &str,
    host_session_key: &str,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs \
         SET status = 'active', \
             host_run_id = $2, \
             host_session_key = $3, \
             started_at = NOW() \
         WHERE id = $1 AND status IN ('queued', 'stalled')",
    )
    .bind(id)
    .bind(host_run_id)
    .bind(host_session_key)
    .execute(pool)
    .await
    .context("failed to mark job active")?;

    Ok(res.rows_affected())
}

/// Update the session-key reverse index for a job (tracker operation; the
/// worker normally writes it together with activation).
pub async fn index_job_by_session_key(pool: &PgPool, id: &str, session_key: &str) -> Result<u64> {
    let res = sqlx::query("UPDATE jobs SET host_session_key = $2 WHERE id = $1")
        .bind(id)
        .bind(session_key)
        .execute(pool)
        .await
        .context("failed to index job by session key")?;

    Ok(res.rows_affected())
}

/// Claim the next launchable job on an agent queue and take the lock.
///
/// FIFO by enqueue time; delayed jobs become eligible once `run_at` passes.
/// A `launching` row whose lock has expired is a stalled launch: it is
/// reclaimed with `stalled_count` incremented, and a `stalled` status flips
/// back to `queued` for the new attempt.
pub async fn claim_next_job(
    pool: &PgPool,
    target: &str,
    lock_secs: f64,
) -> Result<Option<JobRecord>> {
    let job = sqlx::query_as::<_, JobRecord>(
        "WITH next AS ( \
             SELECT id, launch_state FROM jobs \
             WHERE target = $1 \
               AND ( \
                   (launch_state IN ('queued', 'delayed') AND run_at <= NOW()) \
                   OR (launch_state = 'launching' AND lock_expires_at < NOW()) \
               ) \
             ORDER BY queued_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE jobs j \
         SET launch_state = 'launching', \
             stalled_count = j.stalled_count \
                 + CASE WHEN next.launch_state = 'launching' THEN 1 ELSE 0 END, \
             status = CASE WHEN j.status = 'stalled' THEN 'queued' ELSE j.status END, \
             lock_expires_at = NOW() + make_interval(secs => $2) \
         FROM next \
         WHERE j.id = next.id \
         RETURNING j.*",
    )
    .bind(target)
    .bind(lock_secs)
    .fetch_optional(pool)
    .await
    .context("failed to claim next job")?;

    Ok(job)
}

/// Schedule a launch retry: back to `delayed` with a future `run_at`.
pub async fn requeue_launch(pool: &PgPool, id: &str, delay_secs: f64) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs \
         SET launch_state = 'delayed', \
             launch_attempts = launch_attempts + 1, \
             run_at = NOW() + make_interval(secs => $2), \
             lock_expires_at = NULL \
         WHERE id = $1 AND launch_state = 'launching'",
    )
    .bind(id)
    .bind(delay_secs)
    .execute(pool)
    .await
    .context("failed to requeue launch")?;

    Ok(res.rows_affected())
}

/// Dead-letter a job whose launch can no longer be retried. The execution
/// status moves to `failed` in the same statement so the record is
/// observable as failed without a separate hook round-trip.
pub async fn dead_letter_job(pool: &PgPool, id: &str, error: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs \
         SET launch_state = 'dead_letter', \
             launch_attempts = launch_attempts + 1, \
             status = 'failed', \
             error = $2, \
             completed_at = NOW(), \
             lock_expires_at = NULL \
         WHERE id = $1 AND launch_state = 'launching'",
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await
    .context("failed to dead-letter job")?;

    Ok(res.rows_affected())
}

/// Release the launch lock after a successful launch.
pub async fn mark_launched(pool: &PgPool, id: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs SET launch_state = 'launched', lock_expires_at = NULL \
         WHERE id = $1 AND launch_state = 'launching'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark job launched")?;

    Ok(res.rows_affected())
}

/// Mark a failed job as retried-by a successor record.
///
/// Optimistic on `status = 'failed'` so a concurrent hook cannot double-spawn
/// the retry chain.
pub async fn mark_retrying(pool: &PgPool, id: &str, retried_by: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'retrying', retried_by_job_id = $2 \
         WHERE id = $1 AND status = 'failed'",
    )
    .bind(id)
    .bind(retried_by)
    .execute(pool)
    .await
    .context("failed to mark job retrying")?;

    Ok(res.rows_affected())
}

/// Exhausted retries: `failed -> failed_permanent`.
pub async fn mark_failed_permanent(pool: &PgPool, id: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'failed_permanent' WHERE id = $1 AND status = 'failed'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark job failed_permanent")?;

    Ok(res.rows_affected())
}

/// Restart recovery, part 1: jobs whose record says the child was running
/// (`active`/`announcing`) were interrupted by the restart. There is no
/// persistent executor to resume them, so recovery is fail-forward.
///
/// Returns the jobs that were force-failed.
pub async fn recover_interrupted_jobs(pool: &PgPool, error: &str) -> Result<Vec<JobRecord>> {
    let jobs = sqlx::query_as::<_, JobRecord>(
        "UPDATE jobs \
         SET status = 'failed', \
             error = $1, \
             completed_at = NOW() \
         WHERE status IN ('active', 'announcing') \
         RETURNING *",
    )
    .bind(error)
    .fetch_all(pool)
    .await
    .context("failed to recover interrupted jobs")?;

    Ok(jobs)
}

/// Restart recovery, part 2: launches interrupted mid-claim are released
/// back to `queued` so the new process can claim them immediately rather
/// than waiting out a dead worker's lock.
pub async fn release_interrupted_launches(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs \
         SET launch_state = 'queued', lock_expires_at = NULL \
         WHERE launch_state = 'launching' AND status = 'queued'",
    )
    .execute(pool)
    .await
    .context("failed to release interrupted launches")?;

    Ok(res.rows_affected())
}

/// Periodic stall sweep: flag launches whose lock expired so operators can
/// see them; the claim query reclaims (or dead-letters) them.
pub async fn sweep_stalled(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs SET status = 'stalled' \
         WHERE launch_state = 'launching' AND lock_expires_at < NOW() AND status = 'queued'",
    )
    .execute(pool)
    .await
    .context("failed to sweep stalled jobs")?;

    Ok(res.rows_affected())
}

/// Count of a dispatcher's currently-active children (fan-out cap input).
pub async fn count_active_children(pool: &PgPool, dispatched_by: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM jobs \
         WHERE dispatched_by = $1 AND status IN ('active', 'announcing')",
    )
    .bind(dispatched_by)
    .fetch_one(pool)
    .await
    .context("failed to count active children")?;

    Ok(row.0)
}

/// Dispatchable depth of a target queue (wait + delayed + active launches).
pub async fn queue_depth(pool: &PgPool, target: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM jobs \
         WHERE target = $1 AND launch_state IN ('queued', 'delayed', 'launching')",
    )
    .bind(target)
    .fetch_one(pool)
    .await
    .context("failed to count queue depth")?;

    Ok(row.0)
}

/// Per-queue counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub delayed: i64,
    pub waiting_deps: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Counters for one agent queue.
pub async fn queue_stats(pool: &PgPool, target: &str) -> Result<QueueStats> {
    let row: (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
        "SELECT \
             COUNT(*) FILTER (WHERE launch_state IN ('queued', 'launching') \
                                AND status NOT IN ('completed', 'failed', 'failed_permanent', 'retrying')), \
             COUNT(*) FILTER (WHERE launch_state = 'delayed'), \
             COUNT(*) FILTER (WHERE launch_state = 'waiting_deps'), \
             COUNT(*) FILTER (WHERE status IN ('active', 'announcing')), \
             COUNT(*) FILTER (WHERE status = 'completed'), \
             COUNT(*) FILTER (WHERE status IN ('failed', 'failed_permanent', 'retrying')) \
         FROM jobs WHERE target = $1",
    )
    .bind(target)
    .fetch_one(pool)
    .await
    .context("failed to fetch queue stats")?;

    Ok(QueueStats {
        waiting: row.0,
        delayed: row.1,
        waiting_deps: row.2,
        active: row.3,
        completed: row.4,
        failed: row.5,
    })
}

/// List the distinct targets that have ever had a job (for stats over all
/// queues, including agents no longer configured).
pub async fn known_targets(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT target FROM jobs ORDER BY target")
        .fetch_all(pool)
        .await
        .context("failed to list known targets")?;

    Ok(rows.into_iter().map(|(t,)| t).collect())
}

/// Filters for [`list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter<'a> {
    pub target: Option<&'a str>,
    pub statuses: Option<&'a [JobStatus]>,
    pub project: Option<&'a str>,
    pub dispatched_by_or_target: Option<&'a str>,
    pub limit: i64,
}

/// List jobs newest-first with optional filters.
///
/// `dispatched_by_or_target` implements the visibility rule for non-system
/// callers: only jobs the caller dispatched or is the target of.
pub async fn list_jobs(pool: &PgPool, filter: &JobFilter<'_>) -> Result<Vec<JobRecord>> {
    let statuses: Option<Vec<String>> = filter
        .statuses
        .map(|s| s.iter().map(|st| st.to_string()).collect());

    let jobs = sqlx::query_as::<_, JobRecord>(
        "SELECT * FROM jobs \
         WHERE ($1::text IS NULL OR target = $1) \
           AND ($2::text[] IS NULL OR status = ANY($2)) \
           AND ($3::text IS NULL OR project = $3) \
           AND ($4::text IS NULL OR dispatched_by = $4 OR target = $4) \
         ORDER BY queued_at DESC \
         LIMIT $5",
    )
    .bind(filter.target)
    .bind(statuses)
    .bind(filter.project)
    .bind(filter.dispatched_by_or_target)
    .bind(filter.limit)
    .fetch_all(pool)
    .await
    .context("failed to list jobs")?;

    Ok(jobs)
}

/// The most recent active job per target, for the activity view.
pub async fn current_jobs_by_target(pool: &PgPool) -> Result<Vec<JobRecord>> {
    let jobs = sqlx::query_as::<_, JobRecord>(
        "SELECT DISTINCT ON (target) * FROM jobs \
         WHERE status IN ('active', 'announcing') \
         ORDER BY target, started_at DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to fetch current jobs by target")?;

    Ok(jobs)
}

/// Drain a queue: delete jobs that have not launched yet. Active and
/// terminal records are untouched.
pub async fn drain_queue(pool: &PgPool, target: &str) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM jobs \
         WHERE target = $1 \
           AND launch_state IN ('waiting_deps', 'queued', 'delayed') \
           AND status IN ('queued', 'stalled')",
    )
    .bind(target)
    .execute(pool)
    .await
    .context("failed to drain queue")?;

    Ok(res.rows_affected())
}

/// Retention sweep: prune terminal jobs past their retention window or
/// beyond the per-class keep count. Returns rows deleted.
pub async fn prune_terminal_jobs(
    pool: &PgPool,
    completed_days: f64,
    completed_keep: i64,
    failed_days: f64,
    failed_keep: i64,
) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM jobs WHERE id IN ( \
             SELECT id FROM jobs \
             WHERE status = 'completed' \
               AND completed_at < NOW() - make_interval(secs => $1 * 86400.0) \
             UNION \
             SELECT id FROM ( \
                 SELECT id, ROW_NUMBER() OVER (ORDER BY completed_at DESC) AS rn \
                 FROM jobs WHERE status = 'completed' \
             ) ranked WHERE rn > $2 \
             UNION \
             SELECT id FROM jobs \
             WHERE status IN ('failed', 'failed_permanent', 'retrying') \
               AND completed_at < NOW() - make_interval(secs => $3 * 86400.0) \
             UNION \
             SELECT id FROM ( \
                 SELECT id, ROW_NUMBER() OVER (ORDER BY completed_at DESC NULLS LAST) AS rn \
                 FROM jobs WHERE status IN ('failed', 'failed_permanent', 'retrying') \
             ) ranked WHERE rn > $4 \
         )",
    )
    .bind(completed_days)
    .bind(completed_keep)
    .bind(failed_days)
    .bind(failed_keep)
    .execute(pool)
    .await
    .context("failed to prune terminal jobs")?;

    Ok(res.rows_affected())
}
