//! The dispatch tool: validates and routes every dispatch.
//!
//! Tool entry points never return `Err` to the caller; every failure is
//! encoded in the structured reply. The store-unreachable path and the
//! breaker's fallback path both answer by starting the child session
//! directly against the host, surfaced with `fallback: true` so callers
//! know tracking is unavailable.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use steward_db::models::CleanupMode;
use steward_db::queries::{jobs as job_db, rate_limits as rate_db};

use crate::approval;
use crate::breaker::{CircuitBreaker, DispatchPath};
use crate::config::{MAX_DEPENDS_ON, MAX_TASK_CHARS, OrchestratorConfig};
use crate::host::{MessageSender, SessionHost};
use crate::identity::CallerIdentity;
use crate::spawn::{self, SpawnSpec};
use crate::tracker::{CreateJobParams, JobTracker};

/// Reply statuses shared by the dispatcher-facing tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Queued,
    PendingApproval,
    Dispatched,
    Error,
    Forbidden,
    NotFound,
    RateLimited,
    QueueFull,
    Unauthorized,
}

/// Inputs to the dispatch tool.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchParams {
    pub target: String,
    pub task: String,
    pub label: Option<String>,
    pub project: Option<String>,
    pub model: Option<String>,
    pub thinking: Option<String>,
    pub run_timeout_seconds: Option<i32>,
    pub cleanup: Option<String>,
    pub depends_on: Vec<String>,
    /// System agents only.
    pub system_prompt_addition: Option<String>,
    pub depth: Option<i32>,
    pub store_result: bool,
    pub requires_approval: bool,
    pub reason: Option<String>,
    // Dispatcher context, supplied by the host.
    pub dispatcher_session_key: Option<String>,
    pub dispatcher_depth: Option<i32>,
    pub origin_channel: Option<String>,
    pub origin_account_id: Option<String>,
    pub origin_to: Option<String>,
    pub origin_thread_id: Option<String>,
}

/// Structured dispatch reply.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReply {
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchReply {
    fn queued(job_id: String, target: &str) -> Self {
        Self {
            status: ToolStatus::Queued,
            job_id: Some(job_id),
            target: Some(target.to_owned()),
            fallback: None,
            fallback_reason: None,
            error: None,
        }
    }

    fn pending_approval(approval_id: String, target: &str) -> Self {
        Self {
            status: ToolStatus::PendingApproval,
            job_id: Some(approval_id),
            target: Some(target.to_owned()),
            fallback: None,
            fallback_reason: None,
            error: None,
        }
    }

    fn dispatched_fallback(target: &str, reason: String) -> Self {
        Self {
            status: ToolStatus::Dispatched,
            job_id: Some(format!("fallback-{}", Utc::now().timestamp_millis())),
            target: Some(target.to_owned()),
            fallback: Some(true),
            fallback_reason: Some(reason),
            error: None,
        }
    }

    fn rejected(status: ToolStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            job_id: None,
            target: None,
            fallback: None,
            fallback_reason: None,
            error: Some(error.into()),
        }
    }
}

/// Serialize a tool reply for the host runtime. Tool surfaces hand JSON
/// back to the caller; serialization itself must never throw.
pub fn reply_json<T: Serialize>(reply: &T) -> serde_json::Value {
    serde_json::to_value(reply)
        .unwrap_or_else(|err| serde_json::json!({ "status": "error", "error": err.to_string() }))
}

/// Everything the dispatch tool reads, resolved at call time so the tool
/// works whether or not the service finished starting.
pub struct DispatchDeps<'a> {
    pub config: &'a OrchestratorConfig,
    pub host: &'a dyn SessionHost,
    pub sender: &'a dyn MessageSender,
    pub breaker: &'a CircuitBreaker,
    /// `None` while the store is unreachable; forces the direct fallback.
    pub tracker: Option<&'a JobTracker>,
}

/// Dispatch a task to a target agent.
pub async fn dispatch(deps: &DispatchDeps<'_>, caller: &str, params: DispatchParams) -> DispatchReply {
    // 1. Store unreachable: go straight to the direct-spawn fallback.
    let Some(tracker) = deps.tracker else {
        return direct_fallback(
            deps,
            caller,
            &params,
            "job store unavailable, dispatched without tracking".to_owned(),
        )
        .await;
    };

    // 2. Parameter validation.
    if params.target.is_empty() {
        return DispatchReply::rejected(ToolStatus::Error, "target is required");
    }
    if params.task.trim().is_empty() {
        return DispatchReply::rejected(ToolStatus::Error, "task is required");
    }
    let task_chars = params.task.chars().count();
    if task_chars > MAX_TASK_CHARS {
        return DispatchReply::rejected(
            ToolStatus::Error,
            format!("task is {task_chars} characters, the maximum is {MAX_TASK_CHARS}"),
        );
    }
    if params.depends_on.len() > MAX_DEPENDS_ON {
        return DispatchReply::rejected(
            ToolStatus::Error,
            format!(
                "depends_on lists {} jobs, the maximum is {MAX_DEPENDS_ON}",
                params.depends_on.len()
            ),
        );
    }

    // 3. Target resolution, allowlist, and elevated-feature checks.
    let identity = CallerIdentity::resolve(deps.config, caller);
    if deps.config.agent(&params.target).is_none() {
        return DispatchReply::rejected(
            ToolStatus::Error,
            format!("unknown target agent: {}", params.target),
        );
    }
    if params.target != caller {
        let allowed = deps
            .config
            .agent(caller)
            .map(|a| a.allows(&params.target))
            .unwrap_or(false);
        if !allowed {
            return DispatchReply::rejected(
                ToolStatus::Forbidden,
                format!("{caller} is not allowed to dispatch to {}", params.target),
            );
        }
    }
    if params.system_prompt_addition.is_some() && !identity.is_system {
        return DispatchReply::rejected(
            ToolStatus::Forbidden,
            "system_prompt_addition is restricted to system agents",
        );
    }

    // 4. Approval routing: explicit request, or any non-orchestrator caller.
    if params.requires_approval || !identity.is_orchestrator {
        if deps.config.approval.channel_id.is_none() {
            // Reject rather than orphan an unapprovable record.
            return DispatchReply::rejected(
                ToolStatus::Error,
                "approval required but no approval channel is configured",
            );
        }
        return match approval::create_approval(
            tracker.pool(),
            deps.config,
            deps.sender,
            caller,
            &params,
        )
        .await
        {
            Ok(record) => DispatchReply::pending_approval(record.id.to_string(), &params.target),
            Err(err) => {
                DispatchReply::rejected(ToolStatus::Error, format!("approval routing failed: {err:#}"))
            }
        };
    }

    // 5. Per-caller rate limit (atomic increment-in-window).
    let limit = deps.config.rate_limit.dispatches_per_minute;
    if limit > 0 {
        match rate_db::increment_dispatch_count(tracker.pool(), caller).await {
            Ok(count) if count > limit => {
                return DispatchReply::rejected(
                    ToolStatus::RateLimited,
                    format!("Rate limit exceeded: {count}/{limit} dispatches this minute"),
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(caller, error = %err, "rate-limit check failed, not counting");
            }
        }
    }

    // 6. Per-target queue-depth cap.
    let max_depth = deps.config.rate_limit.max_queue_depth;
    if max_depth > 0 {
        match job_db::queue_depth(tracker.pool(), &params.target).await {
            Ok(depth) if depth >= max_depth => {
                return DispatchReply::rejected(
                    ToolStatus::QueueFull,
                    format!(
                        "queue for {} is full: {depth}/{max_depth} jobs",
                        params.target
                    ),
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(target = %params.target, error = %err, "depth check failed");
            }
        }
    }

    // Dependencies must exist before the flow is created; a bad reference
    // is a caller error, not a store failure the breaker should count.
    for dep_id in &params.depends_on {
        match job_db::get_job(tracker.pool(), dep_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return DispatchReply::rejected(
                    ToolStatus::NotFound,
                    format!("dependency job {dep_id} not found"),
                );
            }
            Err(err) => {
                return DispatchReply::rejected(
                    ToolStatus::Error,
                    format!("dependency lookup failed: {err:#}"),
                );
            }
        }
    }

    // 7. Create through the breaker; fall back to a direct spawn when the
    //    store path is broken.
    let create_params = to_create_params(caller, &params);
    let target = params.target.clone();
    let outcome = deps
        .breaker
        .dispatch(
            || tracker.create_job(create_params),
            || async {
                let child = direct_spawn(deps, caller, &params).await?;
                Ok(child.run_id)
            },
        )
        .await;

    // 8. Shape the reply.
    match outcome {
        Ok(DispatchPath::Primary(job_id)) => DispatchReply::queued(job_id, &target),
        Ok(DispatchPath::Fallback(_run_id, reason)) => {
            DispatchReply::dispatched_fallback(&target, reason)
        }
        Err(err) => {
            if steward_db::pool::is_auth_failure(&err) {
                deps.breaker.force_open("store authentication failure");
            }
            DispatchReply::rejected(ToolStatus::Error, format!("dispatch failed: {err:#}"))
        }
    }
}

fn to_create_params(caller: &str, params: &DispatchParams) -> CreateJobParams {
    CreateJobParams {
        job_id: None,
        target: params.target.clone(),
        task: params.task.clone(),
        dispatched_by: caller.to_owned(),
        project: params.project.clone(),
        label: params.label.clone(),
        model: params.model.clone(),
        thinking_level: params.thinking.clone(),
        system_prompt_addition: params.system_prompt_addition.clone(),
        cleanup: CleanupMode::coerce(params.cleanup.as_deref()),
        depth: params.depth.or(params.dispatcher_depth).unwrap_or(0),
        depends_on: params.depends_on.clone(),
        dispatcher_session_key: params.dispatcher_session_key.clone(),
        dispatcher_depth: params.dispatcher_depth.or(params.depth),
        dispatcher_channel: params.origin_channel.clone(),
        dispatcher_account_id: params.origin_account_id.clone(),
        dispatcher_to: params.origin_to.clone(),
        dispatcher_thread_id: params.origin_thread_id.clone(),
        timeout_seconds: spawn::clamp_timeout_seconds(params.run_timeout_seconds),
        store_result: params.store_result,
        retry_count: 0,
        original_job_id: None,
        run_at: None,
    }
}

/// Start the child directly against the host, bypassing the store.
async fn direct_spawn(
    deps: &DispatchDeps<'_>,
    caller: &str,
    params: &DispatchParams,
) -> anyhow::Result<spawn::SpawnedChild> {
    let caller_depth = params.depth.or(params.dispatcher_depth).unwrap_or(0);
    let spec = SpawnSpec {
        target: params.target.clone(),
        task: params.task.clone(),
        child_depth: caller_depth + 1,
        model: params.model.clone(),
        thinking_level: params.thinking.clone(),
        system_prompt_addition: params.system_prompt_addition.clone(),
        timeout_seconds: params.run_timeout_seconds,
        dispatched_by: caller.to_owned(),
        label: params.label.clone(),
        requester_session_key: params.dispatcher_session_key.clone(),
    };
    spawn::launch_child(deps.host, deps.config, &spec)
        .await
        .map_err(|err| anyhow::anyhow!("{err:#}"))
}

/// The store-unreachable path: spawn immediately, answer with a synthetic
/// job id.
async fn direct_fallback(
    deps: &DispatchDeps<'_>,
    caller: &str,
    params: &DispatchParams,
    reason: String,
) -> DispatchReply {
    match direct_spawn(deps, caller, params).await {
        Ok(child) => {
            tracing::warn!(
                target = %params.target,
                run_id = %child.run_id,
                "dispatched via direct fallback"
            );
            DispatchReply::dispatched_fallback(&params.target, reason)
        }
        Err(err) => DispatchReply::rejected(
            ToolStatus::Error,
            format!("fallback dispatch failed: {err:#}"),
        ),
    }
}
