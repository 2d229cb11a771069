//! Query functions for the `approvals` table.
//!
//! The approve/reject transitions are compare-and-swap: a single conditional
//! UPDATE is the linearization point, so of two racing operations exactly one
//! wins and the loser observes the winner's status.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ApprovalRecord, ApprovalStatus};

/// Parameters for inserting a new approval record.
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub id: Uuid,
    pub caller: String,
    pub target: String,
    pub task: String,
    pub label: Option<String>,
    pub project: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub timeout_seconds: Option<i32>,
    pub cleanup: String,
    pub reason: Option<String>,
    pub ttl_days: f64,
    pub notification_message_id: Option<String>,
    pub notification_channel_id: Option<String>,
}

/// Outcome of a compare-and-swap transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The transition applied.
    Applied,
    /// The record is already in this status (idempotency signal).
    AlreadyInStatus(ApprovalStatus),
    /// No record with this id.
    Missing,
}

/// Insert a pending approval record. The notification linkage is written in
/// the same statement, so the record and its reverse index land together.
pub async fn insert_approval(pool: &PgPool, approval: &NewApproval) -> Result<ApprovalRecord> {
    let record = sqlx::query_as::<_, ApprovalRecord>(
        "INSERT INTO approvals (id, caller, target, task, label, project, model, \
                                thinking_level, timeout_seconds, cleanup, reason, expires_at, \
                                notification_message_id, notification_channel_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, \
                 NOW() + make_interval(secs => $12 * 86400.0), $13, $14) \
         RETURNING *",
    )
    .bind(approval.id)
    .bind(&approval.caller)
    .bind(&approval.target)
    .bind(&approval.task)
    .bind(&approval.label)
    .bind(&approval.project)
    .bind(&approval.model)
    .bind(&approval.thinking_level)
    .bind(approval.timeout_seconds)
    .bind(&approval.cleanup)
    .bind(&approval.reason)
    .bind(approval.ttl_days)
    .bind(&approval.notification_message_id)
    .bind(&approval.notification_channel_id)
    .fetch_one(pool)
    .await
    .context("failed to insert approval")?;

    Ok(record)
}

/// Fetch an approval by id.
pub async fn get_approval(pool: &PgPool, id: Uuid) -> Result<Option<ApprovalRecord>> {
    let record = sqlx::query_as::<_, ApprovalRecord>("SELECT * FROM approvals WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch approval")?;

    Ok(record)
}

/// Prefix-match an id fragment against actionable records (pending, plus
/// spawn-failed records which are retry-eligible). Returns all matches so
/// the caller can reject ambiguous fragments.
pub async fn match_approval_prefix(pool: &PgPool, prefix: &str) -> Result<Vec<ApprovalRecord>> {
    // The fragment interpolates into LIKE; keep it to hex/dash characters.
    let safe: String = prefix
        .chars()
        .filter(|c| c.is_ascii_hexdigit() || *c == '-')
        .collect();
    if safe.is_empty() {
        return Ok(Vec::new());
    }

    let records = sqlx::query_as::<_, ApprovalRecord>(
        "SELECT * FROM approvals \
         WHERE status IN ('pending', 'approved_spawn_failed') \
           AND id::text LIKE $1 || '%' \
         ORDER BY created_at ASC",
    )
    .bind(safe)
    .fetch_all(pool)
    .await
    .context("failed to prefix-match approvals")?;

    Ok(records)
}

/// CAS: `pending -> approved`, or `approved_spawn_failed -> approved` for
/// the spawn-retry path.
pub async fn cas_approve(pool: &PgPool, id: Uuid, approved_by: &str) -> Result<CasOutcome> {
    let res = sqlx::query(
        "UPDATE approvals \
         SET status = 'approved', approved_at = NOW(), approved_by = $2 \
         WHERE id = $1 AND status IN ('pending', 'approved_spawn_failed')",
    )
    .bind(id)
    .bind(approved_by)
    .execute(pool)
    .await
    .context("failed to CAS-approve")?;

    if res.rows_affected() > 0 {
        return Ok(CasOutcome::Applied);
    }
    match get_approval(pool, id).await? {
        Some(record) => Ok(CasOutcome::AlreadyInStatus(record.status)),
        None => Ok(CasOutcome::Missing),
    }
}

/// CAS: `pending -> rejected` only. Never overwrites approved,
/// approved_spawn_failed, or rejected.
pub async fn cas_reject(pool: &PgPool, id: Uuid, rejected_by: &str) -> Result<CasOutcome> {
    let res = sqlx::query(
        "UPDATE approvals \
         SET status = 'rejected', rejected_at = NOW(), approved_by = $2 \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .bind(rejected_by)
    .execute(pool)
    .await
    .context("failed to CAS-reject")?;

    if res.rows_affected() > 0 {
        return Ok(CasOutcome::Applied);
    }
    match get_approval(pool, id).await? {
        Some(record) => Ok(CasOutcome::AlreadyInStatus(record.status)),
        None => Ok(CasOutcome::Missing),
    }
}

/// Mark a record expired (only valid from pending).
pub async fn mark_expired(pool: &PgPool, id: Uuid) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE approvals SET status = 'expired', expired_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark approval expired")?;

    Ok(res.rows_affected())
}

/// Post-approval spawn failure: the record becomes retry-eligible.
pub async fn mark_spawn_failed(pool: &PgPool, id: Uuid) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE approvals SET status = 'approved_spawn_failed' \
         WHERE id = $1 AND status = 'approved'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark approval spawn-failed")?;

    Ok(res.rows_affected())
}

/// Record the successful post-approval spawn; the record is now terminal.
pub async fn set_spawn_linkage(
    pool: &PgPool,
    id: Uuid,
    run_id: &str,
    session_key: &str,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE approvals SET spawn_run_id = $2, spawn_session_key = $3 \
         WHERE id = $1 AND status = 'approved'",
    )
    .bind(id)
    .bind(run_id)
    .bind(session_key)
    .execute(pool)
    .await
    .context("failed to set spawn linkage")?;

    Ok(res.rows_affected())
}

/// Reverse index lookup: notification message id -> approval.
pub async fn find_by_notification_message(
    pool: &PgPool,
    message_id: &str,
) -> Result<Option<ApprovalRecord>> {
    let record = sqlx::query_as::<_, ApprovalRecord>(
        "SELECT * FROM approvals WHERE notification_message_id = $1 \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await
    .context("failed to find approval by notification message")?;

    Ok(record)
}

/// Pending approvals, oldest first.
pub async fn list_pending(pool: &PgPool, limit: i64) -> Result<Vec<ApprovalRecord>> {
    let records = sqlx::query_as::<_, ApprovalRecord>(
        "SELECT * FROM approvals WHERE status = 'pending' \
         ORDER BY created_at ASC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list pending approvals")?;

    Ok(records)
}

/// Pending approvals scoped to a project.
pub async fn list_pending_for_project(
    pool: &PgPool,
    project: &str,
    limit: i64,
) -> Result<Vec<ApprovalRecord>> {
    let records = sqlx::query_as::<_, ApprovalRecord>(
        "SELECT * FROM approvals WHERE status = 'pending' AND project = $2 \
         ORDER BY created_at ASC LIMIT $1",
    )
    .bind(limit)
    .bind(project)
    .fetch_all(pool)
    .await
    .context("failed to list pending approvals for project")?;

    Ok(records)
}

/// TTL sweep: flip pending records past their expiry to `expired`, then
/// hard-delete records a full retention window past expiry. The reverse
/// index lives on the same row, so it can never outlive the record.
pub async fn sweep_expired(pool: &PgPool) -> Result<u64> {
    let marked = sqlx::query(
        "UPDATE approvals SET status = 'expired', expired_at = NOW() \
         WHERE status = 'pending' AND expires_at < NOW()",
    )
    .execute(pool)
    .await
    .context("failed to sweep expired approvals")?;

    sqlx::query(
        "DELETE FROM approvals \
         WHERE expires_at < NOW() - make_interval(days => 30) AND status != 'pending'",
    )
    .execute(pool)
    .await
    .context("failed to delete aged-out approvals")?;

    Ok(marked.rows_affected())
}
