//! The dependency-gate worker.
//!
//! Gates are lightweight children blocking a parent job on one other job's
//! completion. The worker polls each referenced dependency until it
//! completes (gate completes, parent may unlock), fails (gate fails,
//! parent stays blocked: fail-fast), or the polling cap elapses (gate is
//! requeued, bounded by an attempt budget).

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use steward_db::models::{DepGate, JobStatus};
use steward_db::queries::{gates as gate_db, jobs as job_db};

use crate::config::OrchestratorConfig;

/// The gate worker: a single claim loop fanning out to a bounded number of
/// concurrent pollers.
pub struct GateWorker {
    pub pool: PgPool,
    pub config: Arc<OrchestratorConfig>,
    pub cancel: CancellationToken,
}

impl GateWorker {
    pub async fn run(self) {
        let tuning = &self.config.queue;
        let semaphore = Arc::new(Semaphore::new(tuning.gate_concurrency.max(1)));
        let idle = Duration::from_secs(1);
        tracing::info!(concurrency = tuning.gate_concurrency, "gate worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Hold a permit before claiming so a claimed gate always has a
            // poller slot.
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };

            let claimed = gate_db::claim_next_gate(&self.pool, tuning.gate_lock_secs).await;
            let gate = match claimed {
                Ok(Some(gate)) => gate,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => continue,
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Err(err) => {
                    drop(permit);
                    tracing::warn!(error = %err, "gate claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(idle) => continue,
                        _ = self.cancel.cancelled() => break,
                    }
                }
            };

            let pool = self.pool.clone();
            let config = Arc::clone(&self.config);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                process_gate(&pool, &config, gate, cancel).await;
                drop(permit);
            });
        }

        tracing::info!("gate worker stopped");
    }
}

/// Poll one gate's dependency to resolution.
async fn process_gate(
    pool: &PgPool,
    config: &OrchestratorConfig,
    gate: DepGate,
    cancel: CancellationToken,
) {
    let tuning = &config.queue;

    // A reclaimed gate that already burned its attempt budget fails for
    // good; the parent stays blocked.
    if gate.attempts > tuning.gate_max_attempts {
        tracing::warn!(
            gate_id = %gate.id,
            parent = %gate.parent_job_id,
            attempts = gate.attempts,
            "gate exceeded its attempt budget, failing"
        );
        if let Err(err) = gate_db::fail_gate(
            pool,
            gate.id,
            "timed out waiting for dependency to complete",
        )
        .await
        {
            tracing::warn!(gate_id = %gate.id, error = %err, "failed to fail gate");
        }
        return;
    }

    let poll = Duration::from_secs_f64(tuning.gate_poll_secs.max(0.1));
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(tuning.gate_timeout_secs);

    loop {
        if cancel.is_cancelled() {
            // Leave the gate running; the lock expiry reclaims it after
            // restart.
            return;
        }

        let dependency = match job_db::get_job(pool, &gate.dependency_job_id).await {
            Ok(dep) => dep,
            Err(err) => {
                tracing::warn!(gate_id = %gate.id, error = %err, "dependency lookup failed");
                None
            }
        };

        match dependency.map(|d| d.status) {
            Some(JobStatus::Completed) => {
                if let Err(err) = gate_db::complete_gate(pool, gate.id).await {
                    tracing::warn!(gate_id = %gate.id, error = %err, "failed to complete gate");
                    return;
                }
                match gate_db::unlock_parent_if_ready(pool, &gate.parent_job_id).await {
                    Ok(true) => {
                        tracing::info!(
                            parent = %gate.parent_job_id,
                            "all gates completed, parent unlocked"
                        );
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(
                            parent = %gate.parent_job_id,
                            error = %err,
                            "failed to unlock parent"
                        );
                    }
                }
                return;
            }
            Some(JobStatus::Failed | JobStatus::FailedPermanent | JobStatus::Retrying) => {
                // Fail-fast: the parent is never processed.
                let msg = format!("dependency {} failed", gate.dependency_job_id);
                tracing::warn!(
                    gate_id = %gate.id,
                    parent = %gate.parent_job_id,
                    dependency = %gate.dependency_job_id,
                    "dependency failed, gating parent permanently"
                );
                if let Err(err) = gate_db::fail_gate(pool, gate.id, &msg).await {
                    tracing::warn!(gate_id = %gate.id, error = %err, "failed to fail gate");
                }
                return;
            }
            None => {
                // The dependency record vanished (pruned or never durable):
                // indistinguishable from failure, gate fail-fast.
                let msg = format!("dependency {} no longer exists", gate.dependency_job_id);
                if let Err(err) = gate_db::fail_gate(pool, gate.id, &msg).await {
                    tracing::warn!(gate_id = %gate.id, error = %err, "failed to fail gate");
                }
                return;
            }
            Some(_) => {
                // Still in flight.
                if tokio::time::Instant::now() >= deadline {
                    // Recoverable timeout: requeue within the attempt budget.
                    tracing::info!(
                        gate_id = %gate.id,
                        attempts = gate.attempts,
                        "gate polling window elapsed, requeueing"
                    );
                    if let Err(err) =
                        gate_db::requeue_gate(pool, gate.id, tuning.gate_poll_secs).await
                    {
                        tracing::warn!(gate_id = %gate.id, error = %err, "failed to requeue gate");
                    }
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}
