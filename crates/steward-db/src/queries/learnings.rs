//! Query functions for the append-only `learnings` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::LearningEntry;

/// Parameters for appending a learning entry.
#[derive(Debug, Clone)]
pub struct NewLearning {
    pub id: Uuid,
    pub job_id: String,
    pub previous_job_id: Option<String>,
    pub project_id: String,
    pub phase: Option<String>,
    pub agent_id: String,
    pub learning: String,
    pub tags: Vec<String>,
    pub ttl_days: f64,
}

/// Append a learning entry.
pub async fn insert_learning(pool: &PgPool, entry: &NewLearning) -> Result<LearningEntry> {
    let record = sqlx::query_as::<_, LearningEntry>(
        "INSERT INTO learnings (id, job_id, previous_job_id, project_id, phase, agent_id, \
                                learning, tags, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, \
                 NOW() + make_interval(secs => $9 * 86400.0)) \
         RETURNING *",
    )
    .bind(entry.id)
    .bind(&entry.job_id)
    .bind(&entry.previous_job_id)
    .bind(&entry.project_id)
    .bind(&entry.phase)
    .bind(&entry.agent_id)
    .bind(&entry.learning)
    .bind(&entry.tags)
    .bind(entry.ttl_days)
    .fetch_one(pool)
    .await
    .context("failed to insert learning")?;

    Ok(record)
}

/// Learnings for a project, newest first, optionally filtered to entries
/// carrying at least one of the given tags.
pub async fn list_for_project(
    pool: &PgPool,
    project_id: &str,
    tags: Option<&[String]>,
    limit: i64,
) -> Result<Vec<LearningEntry>> {
    let records = sqlx::query_as::<_, LearningEntry>(
        "SELECT * FROM learnings \
         WHERE project_id = $1 \
           AND expires_at > NOW() \
           AND ($2::text[] IS NULL OR tags && $2) \
         ORDER BY created_at DESC \
         LIMIT $3",
    )
    .bind(project_id)
    .bind(tags)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list learnings for project")?;

    Ok(records)
}

/// Learnings for a job, in insertion order.
pub async fn list_for_job(
    pool: &PgPool,
    job_id: &str,
    tags: Option<&[String]>,
    limit: i64,
) -> Result<Vec<LearningEntry>> {
    let records = sqlx::query_as::<_, LearningEntry>(
        "SELECT * FROM learnings \
         WHERE job_id = $1 \
           AND expires_at > NOW() \
           AND ($2::text[] IS NULL OR tags && $2) \
         ORDER BY created_at ASC \
         LIMIT $3",
    )
    .bind(job_id)
    .bind(tags)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list learnings for job")?;

    Ok(records)
}

/// TTL sweep: delete entries past their expiry.
pub async fn sweep_expired(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query("DELETE FROM learnings WHERE expires_at < NOW()")
        .execute(pool)
        .await
        .context("failed to sweep expired learnings")?;

    Ok(res.rows_affected())
}
