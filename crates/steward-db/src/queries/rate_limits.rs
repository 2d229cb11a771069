//! Per-caller dispatch rate limiting.
//!
//! One atomic statement increments the caller's counter and resets the 60 s
//! window when it has rolled, mirroring an INCR-with-TTL store script. Two
//! racing dispatches serialize on this statement; both outcomes (both under
//! the limit, one over) are acceptable interleavings.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Window length for the dispatch rate limit.
pub const WINDOW_SECS: f64 = 60.0;

/// Increment the caller's counter within the current window and return the
/// post-increment count.
pub async fn increment_dispatch_count(pool: &PgPool, caller_id: &str) -> Result<i64> {
    let row: (i32,) = sqlx::query_as(
        "INSERT INTO dispatch_rate (caller_id, window_start, count) \
         VALUES ($1, NOW(), 1) \
         ON CONFLICT (caller_id) DO UPDATE SET \
             count = CASE \
                 WHEN dispatch_rate.window_start <= NOW() - make_interval(secs => $2) THEN 1 \
                 ELSE dispatch_rate.count + 1 \
             END, \
             window_start = CASE \
                 WHEN dispatch_rate.window_start <= NOW() - make_interval(secs => $2) THEN NOW() \
                 ELSE dispatch_rate.window_start \
             END \
         RETURNING count",
    )
    .bind(caller_id)
    .bind(WINDOW_SECS)
    .fetch_one(pool)
    .await
    .context("failed to increment dispatch count")?;

    Ok(row.0 as i64)
}

/// Drop windows that rolled over long ago (stale-counter sweep).
pub async fn sweep_stale_windows(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM dispatch_rate WHERE window_start < NOW() - make_interval(secs => $1 * 10)",
    )
    .bind(WINDOW_SECS)
    .execute(pool)
    .await
    .context("failed to sweep stale rate windows")?;

    Ok(res.rows_affected())
}
