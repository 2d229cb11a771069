//! Query functions for the `dep_gates` table.

use anyhow::{Context, Result};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::DepGate;

/// Insert one gate row for a (parent, dependency) edge.
///
/// Takes an executor so flow creation can run parent + gates in one
/// transaction.
pub async fn insert_gate(
    executor: impl PgExecutor<'_>,
    parent_job_id: &str,
    dependency_job_id: &str,
    parent_target: &str,
) -> Result<Uuid> {
    let row: (Uuid,) = sqlx::query_as(
        "INSERT INTO dep_gates (parent_job_id, dependency_job_id, parent_target) \
         VALUES ($1, $2, $3) \
         RETURNING id",
    )
    .bind(parent_job_id)
    .bind(dependency_job_id)
    .bind(parent_target)
    .fetch_one(executor)
    .await
    .context("failed to insert dependency gate")?;

    Ok(row.0)
}

/// Claim the next processable gate and take its lock.
///
/// Pending gates and running gates with an expired lock are both claimable;
/// the latter are reclaimed with `attempts` incremented.
pub async fn claim_next_gate(pool: &PgPool, lock_secs: f64) -> Result<Option<DepGate>> {
    let gate = sqlx::query_as::<_, DepGate>(
        "WITH next AS ( \
             SELECT id, state FROM dep_gates \
             WHERE (state = 'pending' AND run_at <= NOW()) \
                OR (state = 'running' AND lock_expires_at < NOW()) \
             ORDER BY created_at ASC \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE dep_gates g \
         SET state = 'running', \
             attempts = g.attempts + CASE WHEN next.state = 'running' THEN 1 ELSE 0 END, \
             lock_expires_at = NOW() + make_interval(secs => $1) \
         FROM next \
         WHERE g.id = next.id \
         RETURNING g.*",
    )
    .bind(lock_secs)
    .fetch_optional(pool)
    .await
    .context("failed to claim dependency gate")?;

    Ok(gate)
}

/// Complete a gate.
pub async fn complete_gate(pool: &PgPool, id: Uuid) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE dep_gates SET state = 'completed', lock_expires_at = NULL \
         WHERE id = $1 AND state = 'running'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to complete gate")?;

    Ok(res.rows_affected())
}

/// Fail a gate permanently (fail-fast: the parent stays blocked).
pub async fn fail_gate(pool: &PgPool, id: Uuid, error: &str) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE dep_gates SET state = 'failed', error = $2, lock_expires_at = NULL \
         WHERE id = $1 AND state = 'running'",
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await
    .context("failed to fail gate")?;

    Ok(res.rows_affected())
}

/// Release a gate back to pending for a timed-out poll (recoverable).
pub async fn requeue_gate(pool: &PgPool, id: Uuid, delay_secs: f64) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE dep_gates \
         SET state = 'pending', \
             attempts = attempts + 1, \
             run_at = NOW() + make_interval(secs => $2), \
             lock_expires_at = NULL \
         WHERE id = $1 AND state = 'running'",
    )
    .bind(id)
    .bind(delay_secs)
    .execute(pool)
    .await
    .context("failed to requeue gate")?;

    Ok(res.rows_affected())
}

/// Unlock the parent job if (and only if) every one of its gates completed.
///
/// Returns `true` when the parent moved to `queued`.
pub async fn unlock_parent_if_ready(pool: &PgPool, parent_job_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE jobs \
         SET launch_state = 'queued', run_at = NOW() \
         WHERE id = $1 \
           AND launch_state = 'waiting_deps' \
           AND NOT EXISTS ( \
               SELECT 1 FROM dep_gates \
               WHERE parent_job_id = $1 AND state != 'completed' \
           )",
    )
    .bind(parent_job_id)
    .execute(pool)
    .await
    .context("failed to unlock parent job")?;

    Ok(res.rows_affected() > 0)
}

/// Gates attached to a parent job.
pub async fn gates_for_parent(pool: &PgPool, parent_job_id: &str) -> Result<Vec<DepGate>> {
    let gates = sqlx::query_as::<_, DepGate>(
        "SELECT * FROM dep_gates WHERE parent_job_id = $1 ORDER BY created_at ASC",
    )
    .bind(parent_job_id)
    .fetch_all(pool)
    .await
    .context("failed to list gates for parent")?;

    Ok(gates)
}

/// Stale-index sweep: drop gates whose dependency job no longer exists.
/// Parent-side orphans are handled by the FK cascade. Processed in batches
/// to avoid one long-running delete.
pub async fn prune_orphaned_gates(pool: &PgPool, batch: i64) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let res = sqlx::query(
            "DELETE FROM dep_gates WHERE id IN ( \
                 SELECT g.id FROM dep_gates g \
                 LEFT JOIN jobs d ON d.id = g.dependency_job_id \
                 WHERE d.id IS NULL \
                 LIMIT $1 \
             )",
        )
        .bind(batch)
        .execute(pool)
        .await
        .context("failed to prune orphaned gates")?;

        total += res.rows_affected();
        if res.rows_affected() < batch as u64 {
            break;
        }
    }
    Ok(total)
}
