//! Lifecycle hooks: translate session-host events into job state
//! transitions.
//!
//! Two hooks exist. The spawn-observed hook is the backward-compatibility
//! path for agents still calling the host's spawn tool directly: it creates
//! a tracking job after the fact so those spawns appear in the queues. The
//! agent-end hook closes the loop on execution: it resolves the job through
//! the session-key index, writes the terminal status, captures the result
//! when asked to, and drives the agent-level retry chain.
//!
//! Hooks never propagate errors to the host runtime; failures are logged
//! and swallowed.

use tokio::sync::broadcast;

use steward_db::models::{JobStatus, LaunchState};
use steward_db::queries::jobs::{self as job_db, NewJob};

use crate::alert::QueueEvent;
use crate::config::{MAX_RESULT_CHARS, OrchestratorConfig};
use crate::host::{MessageSender, SessionHost};
use crate::text;
use crate::tracker::{CreateJobParams, JobTracker};

/// Everything the hooks read, resolved at call time.
pub struct HookDeps<'a> {
    pub config: &'a OrchestratorConfig,
    pub host: &'a dyn SessionHost,
    pub sender: &'a dyn MessageSender,
    /// `None` while the store is unreachable; hooks become no-ops.
    pub tracker: Option<&'a JobTracker>,
    pub events: Option<&'a broadcast::Sender<QueueEvent>>,
}

/// A spawn observed outside of dispatch (the host's direct spawn tool).
#[derive(Debug, Clone)]
pub struct ObservedSpawn {
    pub run_id: String,
    pub session_key: String,
    pub target: String,
    pub task: String,
    pub dispatched_by: String,
    pub depth: i32,
}

/// Create a tracking job for a directly-spawned child so it shows up in
/// the queues. Idempotent: the run id is the job id.
pub async fn on_spawn_observed(deps: &HookDeps<'_>, spawn: ObservedSpawn) {
    let Some(tracker) = deps.tracker else {
        tracing::debug!(run_id = %spawn.run_id, "no tracker, spawn not recorded");
        return;
    };

    let new_job = NewJob {
        id: spawn.run_id.clone(),
        target: spawn.target.clone(),
        task: spawn.task.clone(),
        dispatched_by: spawn.dispatched_by.clone(),
        cleanup: "keep".to_owned(),
        depth: spawn.depth,
        launch_state: LaunchState::Launched,
        status: JobStatus::Queued,
        host_run_id: Some(spawn.run_id.clone()),
        host_session_key: Some(spawn.session_key.clone()),
        ..Default::default()
    };

    match job_db::insert_job(tracker.pool(), &new_job).await {
        Ok(true) => {
            // The child is already running; move the record to active so
            // the agent-end hook finds it in the expected status.
            if let Err(err) = job_db::mark_job_active(
                tracker.pool(),
                &spawn.run_id,
                &spawn.run_id,
                &spawn.session_key,
            )
            .await
            {
                tracing::warn!(run_id = %spawn.run_id, error = %err, "failed to activate tracking job");
            } else {
                tracing::info!(
                    run_id = %spawn.run_id,
                    target = %spawn.target,
                    "tracking job created for direct spawn"
                );
            }
        }
        Ok(false) => {
            tracing::debug!(run_id = %spawn.run_id, "spawn already tracked");
        }
        Err(err) => {
            tracing::warn!(run_id = %spawn.run_id, error = %err, "failed to record spawn");
        }
    }
}

/// Handle a child session ending.
pub async fn on_agent_end(
    deps: &HookDeps<'_>,
    session_key: &str,
    success: bool,
    error: Option<&str>,
) {
    let Some(tracker) = deps.tracker else {
        tracing::debug!(session_key, "no tracker, agent end not recorded");
        return;
    };

    let job = match tracker.find_job_by_session_key(session_key).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            tracing::debug!(session_key, "agent end for an untracked session");
            return;
        }
        Err(err) => {
            tracing::warn!(session_key, error = %err, "job lookup failed in agent-end hook");
            return;
        }
    };

    if job.status.is_terminal() {
        // A duplicate event; status updates are idempotent.
        tracing::debug!(job_id = %job.id, status = %job.status, "agent end for a terminal job");
        return;
    }

    // Result capture is opt-in per job and only meaningful on success.
    let captured = if success && job.store_result {
        capture_result(deps.host, session_key).await
    } else {
        None
    };

    let to = if success {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    if let Err(err) = settle(tracker, &job.id, job.status, to, error, captured.as_deref()).await {
        tracing::warn!(job_id = %job.id, error = %err, "failed to settle job status");
        return;
    }

    tracing::info!(job_id = %job.id, status = %to, "job settled by agent-end hook");

    if !success {
        retry_or_fail_permanently(deps, tracker, &job.id).await;
    }
}

/// Read the last assistant message from the session, capped at the result
/// limit (silent char-boundary cut).
async fn capture_result(host: &dyn SessionHost, session_key: &str) -> Option<String> {
    match host.fetch_session_history(session_key).await {
        Ok(history) => history
            .iter()
            .rev()
            .find(|m| m.role == "assistant")
            .map(|m| text::truncate_chars(&m.content, MAX_RESULT_CHARS)),
        Err(err) => {
            tracing::warn!(session_key, error = %err, "failed to fetch history for result capture");
            None
        }
    }
}

/// Drive the observed status into `to`, tolerating the announcing hop.
async fn settle(
    tracker: &JobTracker,
    job_id: &str,
    observed: JobStatus,
    to: JobStatus,
    error: Option<&str>,
    result: Option<&str>,
) -> anyhow::Result<()> {
    match tracker
        .update_job_status(job_id, observed, to, error, result)
        .await
    {
        Ok(()) => Ok(()),
        Err(first_err) => {
            // The announce pipeline may have moved the job under us
            // (active -> announcing). Re-read and retry once from the
            // current status.
            let current = tracker.find_job_by_run_id(job_id).await?;
            match current {
                Some(job) if !job.status.is_terminal() && job.status != observed => {
                    tracker
                        .update_job_status(job_id, job.status, to, error, result)
                        .await
                }
                _ => Err(first_err),
            }
        }
    }
}

/// The agent-level retry path: enqueue a successor job with exponential
/// delay, or close the chain with `failed_permanent` plus notifications.
async fn retry_or_fail_permanently(deps: &HookDeps<'_>, tracker: &JobTracker, job_id: &str) {
    let job = match tracker.find_job_by_run_id(job_id).await {
        Ok(Some(job)) => job,
        _ => return,
    };

    let attempts = deps.config.retry.agent_failure_attempts as i32;
    if job.retry_count < attempts - 1 {
        let base_ms = deps.config.retry.agent_failure_base_delay_ms;
        let delay_ms = base_ms.saturating_mul(1u64 << job.retry_count.clamp(0, 16) as u32);
        let run_at = chrono::Utc::now() + chrono::TimeDelta::milliseconds(delay_ms as i64);

        let retry_params = CreateJobParams {
            job_id: None,
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
            depends_on: Vec::new(),
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
            run_at: Some(run_at),
        };

        match tracker.create_job(retry_params).await {
            Ok(new_id) => {
                if let Err(err) = job_db::mark_retrying(tracker.pool(), &job.id, &new_id).await {
                    tracing::warn!(job_id = %job.id, error = %err, "failed to link retry job");
                }
                tracing::info!(
                    job_id = %job.id,
                    retry_job_id = %new_id,
                    retry_count = job.retry_count + 1,
                    delay_ms,
                    "execution failed, retry enqueued"
                );
            }
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "failed to enqueue retry job");
            }
        }
        // Intermediate retry records do not notify.
        return;
    }

    if let Err(err) = job_db::mark_failed_permanent(tracker.pool(), &job.id).await {
        tracing::warn!(job_id = %job.id, error = %err, "failed to mark failed_permanent");
        return;
    }
    tracing::warn!(job_id = %job.id, retry_count = job.retry_count, "retries exhausted");

    // Terminal job only: tell the dispatcher's session, redacted.
    if let Some(dispatcher_key) = &job.dispatcher_session_key {
        let note = format!(
            "Job {} on {} failed permanently after {} attempts: {}",
            job.id,
            job.target,
            job.retry_count + 1,
            text::redact(job.error.as_deref().unwrap_or("no error recorded")),
        );
        if let Err(err) = deps.host.send_to_session(dispatcher_key, &note).await {
            tracing::warn!(job_id = %job.id, error = %err, "failed to notify dispatcher session");
        }
    }

    if let Some(events) = deps.events {
        let _ = events.send(QueueEvent::JobFailedPermanent {
            job_id: job.id.clone(),
            target: job.target.clone(),
            task: job.task.clone(),
            error: job.error.clone(),
        });
    }
}
