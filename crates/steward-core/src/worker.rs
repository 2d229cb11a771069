//! The worker pool: one worker loop per agent queue, concurrency 1 within
//! a queue. Parallelism is across queues, never within one.
//!
//! A worker claims a job, runs the launch sequence, and hands the child's
//! execution lifecycle over to the hooks. The queue considers the job
//! dispatch-completed once the launch returns the child run id; the child
//! session continues independently.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use steward_db::models::JobRecord;
use steward_db::queries::jobs as job_db;

use crate::alert::QueueEvent;
use crate::config::OrchestratorConfig;
use crate::host::SessionHost;
use crate::session;
use crate::spawn::{self, LaunchError, SpawnSpec};

/// A single agent-queue worker.
pub struct AgentWorker {
    pub agent_id: String,
    pub pool: PgPool,
    pub config: Arc<OrchestratorConfig>,
    pub host: Arc<dyn SessionHost>,
    pub events: broadcast::Sender<QueueEvent>,
    pub cancel: CancellationToken,
}

impl AgentWorker {
    /// Consume the queue until cancelled. In-flight launches drain
    /// cooperatively: cancellation is only observed between jobs.
    pub async fn run(self) {
        let poll = Duration::from_millis(self.config.queue.worker_poll_ms);
        tracing::info!(agent = %self.agent_id, "worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let claimed =
                job_db::claim_next_job(&self.pool, &self.agent_id, self.config.queue.lock_secs)
                    .await;

            let job = match claimed {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => continue,
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Err(err) => {
                    tracing::warn!(agent = %self.agent_id, error = %err, "claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => continue,
                        _ = self.cancel.cancelled() => break,
                    }
                }
            };

            self.handle_claimed(job).await;
        }

        tracing::info!(agent = %self.agent_id, "worker stopped");
    }

    /// Apply stall accounting, run the launch, and settle the claim.
    async fn handle_claimed(&self, job: JobRecord) {
        let job_id = job.id.clone();

        if job.stalled_count > self.config.queue.max_stalled_count {
            tracing::warn!(
                job_id = %job_id,
                stalled_count = job.stalled_count,
                "job stalled beyond the allowable limit, dead-lettering"
            );
            self.settle_dead_letter(&job, "job stalled beyond the allowable limit")
                .await;
            return;
        }

        match self.launch(&job).await {
            Ok(run_id) => {
                tracing::info!(
                    job_id = %job_id,
                    agent = %self.agent_id,
                    run_id = %run_id,
                    "launch succeeded"
                );
                if let Err(err) = job_db::mark_launched(&self.pool, &job_id).await {
                    tracing::warn!(job_id = %job_id, error = %err, "failed to mark launched");
                }
            }
            Err(LaunchError::Unrecoverable(msg)) => {
                tracing::warn!(job_id = %job_id, error = %msg, "unrecoverable launch failure");
                self.settle_dead_letter(&job, &msg).await;
            }
            Err(LaunchError::Recoverable(err)) => {
                let attempt = job.launch_attempts + 1;
                if attempt >= self.config.queue.launch_attempts {
                    let msg = format!("launch failed after {attempt} attempts: {err:#}");
                    tracing::warn!(job_id = %job_id, error = %msg, "launch retries exhausted");
                    self.settle_dead_letter(&job, &msg).await;
                } else {
                    let delay = self.config.queue.launch_backoff_base_secs
                        * f64::from(1u32 << job.launch_attempts.min(16) as u32);
                    tracing::info!(
                        job_id = %job_id,
                        attempt,
                        delay_secs = delay,
                        error = %format!("{err:#}"),
                        "launch failed, retrying with backoff"
                    );
                    if let Err(e) = job_db::requeue_launch(&self.pool, &job_id, delay).await {
                        tracing::warn!(job_id = %job_id, error = %e, "failed to requeue launch");
                    }
                }
            }
        }
    }

    async fn settle_dead_letter(&self, job: &JobRecord, error: &str) {
        if let Err(err) = job_db::dead_letter_job(&self.pool, &job.id, error).await {
            tracing::warn!(job_id = %job.id, error = %err, "failed to dead-letter job");
            return;
        }
        let _ = self.events.send(QueueEvent::LaunchDeadLettered {
            job_id: job.id.clone(),
            target: job.target.clone(),
            task: job.task.clone(),
            error: error.to_owned(),
        });
    }

    /// The launch sequence. Steps 1-5 validate; 6-11 live in
    /// [`spawn::launch_child`]; 12-13 persist the linkage; 14 returns the
    /// child run id.
    async fn launch(&self, job: &JobRecord) -> Result<String, LaunchError> {
        // 1. The record is already typed; clamp the timeout.
        let timeout_seconds = spawn::clamp_timeout_seconds(job.timeout_seconds);

        // 2. Resolve the dispatcher-session context.
        let dispatcher_key = job.dispatcher_session_key.clone();
        let dispatcher_display = dispatcher_key.as_deref().map(session::display_key);

        // 3. Depth validation (unrecoverable on violation).
        let caller_depth = match job.dispatcher_depth {
            Some(depth) => depth,
            None => match &dispatcher_key {
                Some(key) => self
                    .host
                    .session_depth(key)
                    .await
                    .map_err(LaunchError::from)?
                    .unwrap_or(0),
                None => 0,
            },
        };
        let max_depth = self.config.limits.max_spawn_depth;
        if caller_depth >= max_depth {
            return Err(LaunchError::unrecoverable(format!(
                "spawn depth {caller_depth} is at the maximum of {max_depth}"
            )));
        }

        // 4. Fan-out validation (recoverable: children finish over time).
        let active_children =
            job_db::count_active_children(&self.pool, &job.dispatched_by)
                .await
                .map_err(LaunchError::Recoverable)?;
        let max_children = self.config.limits.max_children_per_agent;
        if active_children >= max_children {
            return Err(LaunchError::Recoverable(anyhow::anyhow!(
                "{} already has {active_children} active children (cap {max_children})",
                job.dispatched_by
            )));
        }

        // 5. Allowlist validation (unrecoverable).
        if job.target != job.dispatched_by {
            let caller_cfg = self.config.agent(&job.dispatched_by).ok_or_else(|| {
                LaunchError::unrecoverable(format!(
                    "dispatcher {} has no configuration entry",
                    job.dispatched_by
                ))
            })?;
            if !caller_cfg.allows(&job.target) {
                return Err(LaunchError::unrecoverable(format!(
                    "{} is not allowed to dispatch to {}",
                    job.dispatched_by, job.target
                )));
            }
        }
        if self.config.agent(&job.target).is_none() {
            return Err(LaunchError::unrecoverable(format!(
                "target agent {} is not configured",
                job.target
            )));
        }

        // 6-11. Shared spawn routine.
        let spec = SpawnSpec {
            target: job.target.clone(),
            task: job.task.clone(),
            child_depth: caller_depth + 1,
            model: job.model.clone(),
            thinking_level: job.thinking_level.clone(),
            system_prompt_addition: job.system_prompt_addition.clone(),
            timeout_seconds,
            dispatched_by: job.dispatched_by.clone(),
            label: job.label.clone(),
            requester_session_key: dispatcher_key,
        };
        let child = spawn::launch_child(self.host.as_ref(), &self.config, &spec).await?;

        tracing::debug!(
            job_id = %job.id,
            child = %session::display_key(&child.session_key),
            dispatcher = dispatcher_display.as_deref().unwrap_or("-"),
            "child session launched"
        );

        // 12-13. Record activation and the session-key index entry.
        let rows = job_db::mark_job_active(&self.pool, &job.id, &child.run_id, &child.session_key)
            .await
            .map_err(LaunchError::Recoverable)?;
        if rows == 0 {
            // The record moved under us (hook or recovery); the child is
            // launched regardless, so report success and let the hooks own
            // the execution status.
            tracing::warn!(job_id = %job.id, "job was not in a launchable status after spawn");
        }

        // 14. The queue marks the job dispatch-completed with this run id.
        Ok(child.run_id)
    }
}
