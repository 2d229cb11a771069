//! `steward stats`: per-queue counters.

use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;

use steward_core::config::OrchestratorConfig;
use steward_core::tracker::JobTracker;

pub async fn run_stats(
    pool: &PgPool,
    config: &OrchestratorConfig,
    agent: Option<&str>,
) -> Result<()> {
    let tracker = JobTracker::new(pool.clone(), Arc::new(config.clone()));
    let stats = tracker.queue_stats(agent).await?;

    if stats.is_empty() {
        println!("no queues found");
        return Ok(());
    }

    println!(
        "{:<24} {:>8} {:>8} {:>8} {:>8} {:>10} {:>8}",
        "QUEUE", "WAITING", "DELAYED", "GATED", "ACTIVE", "COMPLETED", "FAILED"
    );
    for (queue, s) in &stats {
        println!(
            "{queue:<24} {:>8} {:>8} {:>8} {:>8} {:>10} {:>8}",
            s.waiting, s.delayed, s.waiting_deps, s.active, s.completed, s.failed
        );
    }

    Ok(())
}
