//! The human-approval subsystem: a store-backed mini-workflow for gated
//! dispatches.
//!
//! Records move `pending -> approved | rejected | expired`, with
//! `approved_spawn_failed -> approved` as the only re-entry. Both the
//! command handlers and the reaction handler funnel through the same
//! compare-and-swap core, so concurrent approve/reject reach a single
//! linearization point and exactly one wins.

pub mod reactions;

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use steward_db::models::{ApprovalRecord, ApprovalStatus, JobStatus, LaunchState};
use steward_db::queries::approvals as approval_db;
use steward_db::queries::jobs::{self as job_db, NewJob};

use crate::config::{MAX_NOTIFICATION_CHARS, OrchestratorConfig};
use crate::dispatch::{DispatchParams, ToolStatus};
use crate::host::{MessageSender, SessionHost};
use crate::session;
use crate::spawn::{self, SpawnSpec, SpawnedChild};
use crate::text;

/// Everything the approval handlers read, resolved at call time.
pub struct ApprovalDeps<'a> {
    pub config: &'a OrchestratorConfig,
    pub host: &'a dyn SessionHost,
    pub sender: &'a dyn MessageSender,
    pub pool: &'a PgPool,
}

/// Structured reply for approval commands.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalReply {
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub message: String,
}

impl ApprovalReply {
    fn ok(id: Uuid, message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Ok,
            id: Some(id.to_string()),
            message: message.into(),
        }
    }

    fn rejected(status: ToolStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            id: None,
            message: message.into(),
        }
    }
}

/// Short display form of an approval id.
pub fn short_id(id: Uuid) -> String {
    id.to_string()[..8].to_owned()
}

// ---------------------------------------------------------------------------
// Create path
// ---------------------------------------------------------------------------

/// Create a pending approval for a gated dispatch.
///
/// The notification is sent *before* the record is written; a notification
/// failure aborts the whole operation so no orphan record exists that
/// nobody can see.
pub async fn create_approval(
    pool: &PgPool,
    config: &OrchestratorConfig,
    sender: &dyn MessageSender,
    caller: &str,
    params: &DispatchParams,
) -> anyhow::Result<ApprovalRecord> {
    let channel = config
        .approval
        .channel_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no approval channel configured"))?;

    let id = Uuid::new_v4();
    let notification = notification_text(id, caller, params);

    let message_id = sender
        .send(&channel, &params.target, &notification, &format!("approval-{id}"))
        .await
        .map_err(|err| anyhow::anyhow!("approval notification failed: {err}"))?;

    let record = approval_db::insert_approval(
        pool,
        &approval_db::NewApproval {
            id,
            caller: caller.to_owned(),
            target: params.target.clone(),
            task: params.task.clone(),
            label: params.label.clone(),
            project: params.project.clone(),
            model: params.model.clone(),
            thinking_level: params.thinking.clone(),
            timeout_seconds: spawn::clamp_timeout_seconds(params.run_timeout_seconds),
            cleanup: steward_db::models::CleanupMode::coerce(params.cleanup.as_deref())
                .to_string(),
            reason: params.reason.clone(),
            ttl_days: config.approval.ttl_days(),
            notification_message_id: Some(message_id),
            notification_channel_id: Some(channel),
        },
    )
    .await?;

    tracing::info!(
        approval_id = %id,
        caller,
        target = %params.target,
        "approval requested"
    );

    Ok(record)
}

/// Compose the sanitized, truncated notification body.
fn notification_text(id: Uuid, caller: &str, params: &DispatchParams) -> String {
    let task = text::truncate_with_ellipsis(&text::sanitize(&params.task), MAX_NOTIFICATION_CHARS);
    let mut body = format!(
        "Approval requested: {caller} -> {target} [{short}]\n",
        target = params.target,
        short = short_id(id),
    );
    if let Some(reason) = &params.reason {
        body.push_str(&format!("Reason: {}\n", text::sanitize(reason)));
    }
    body.push_str(&format!("Task: {task}\nReact ✅ to approve, ❌ to reject."));
    body
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

enum Resolved {
    Found(ApprovalRecord),
    NotFound,
    Ambiguous(usize),
}

/// Resolve operator input: a 36-char dashed string is a full UUID;
/// anything shorter prefix-matches against actionable records.
async fn resolve_input(pool: &PgPool, input: &str) -> anyhow::Result<Resolved> {
    let input = input.trim();
    if input.len() == 36 && input.contains('-') {
        let Ok(id) = input.parse::<Uuid>() else {
            return Ok(Resolved::NotFound);
        };
        return Ok(match approval_db::get_approval(pool, id).await? {
            Some(record) => Resolved::Found(record),
            None => Resolved::NotFound,
        });
    }

    let matches = approval_db::match_approval_prefix(pool, input).await?;
    Ok(match matches.len() {
        0 => Resolved::NotFound,
        1 => Resolved::Found(matches.into_iter().next().expect("len checked")),
        n => Resolved::Ambiguous(n),
    })
}

fn authorize(config: &OrchestratorConfig, actor: &str) -> bool {
    // An empty approver list authorizes nobody.
    config
        .approval
        .authorized_approvers
        .iter()
        .any(|a| a == actor)
}

// ---------------------------------------------------------------------------
// Approve / reject
// ---------------------------------------------------------------------------

/// Handle `/approve <shortId|uuid>`.
pub async fn approve(deps: &ApprovalDeps<'_>, input: &str, approver: &str) -> ApprovalReply {
    if !authorize(deps.config, approver) {
        return ApprovalReply::rejected(ToolStatus::Unauthorized, "you are not an authorized approver");
    }

    let record = match resolve_input(deps.pool, input).await {
        Ok(Resolved::Found(record)) => record,
        Ok(Resolved::NotFound) => {
            return ApprovalReply::rejected(ToolStatus::NotFound, format!("no approval matches {input:?}"));
        }
        Ok(Resolved::Ambiguous(n)) => {
            return ApprovalReply::rejected(
                ToolStatus::Error,
                format!("{n} approvals match {input:?}, use more characters"),
            );
        }
        Err(err) => {
            return ApprovalReply::rejected(ToolStatus::Error, format!("lookup failed: {err:#}"));
        }
    };

    approve_record(deps, record.id, approver).await
}

/// The CAS + spawn core shared by the command and reaction handlers.
pub async fn approve_record(deps: &ApprovalDeps<'_>, id: Uuid, approver: &str) -> ApprovalReply {
    // Pre-read for expiry so the caller gets the precise answer rather
    // than an opaque CAS miss.
    match approval_db::get_approval(deps.pool, id).await {
        Ok(Some(record))
            if record.status == ApprovalStatus::Pending && record.expires_at < chrono::Utc::now() =>
        {
            let _ = approval_db::mark_expired(deps.pool, id).await;
            return ApprovalReply::rejected(
                ToolStatus::Error,
                format!("approval {} has expired", short_id(id)),
            );
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            return ApprovalReply::rejected(ToolStatus::NotFound, format!("no approval {id}"));
        }
        Err(err) => {
            return ApprovalReply::rejected(ToolStatus::Error, format!("lookup failed: {err:#}"));
        }
    }

    match approval_db::cas_approve(deps.pool, id, approver).await {
        Ok(approval_db::CasOutcome::Applied) => {}
        Ok(approval_db::CasOutcome::AlreadyInStatus(status)) => {
            return ApprovalReply::rejected(
                ToolStatus::Error,
                format!("Job {} is already {status}", short_id(id)),
            );
        }
        Ok(approval_db::CasOutcome::Missing) => {
            return ApprovalReply::rejected(ToolStatus::NotFound, format!("no approval {id}"));
        }
        Err(err) => {
            return ApprovalReply::rejected(ToolStatus::Error, format!("approve failed: {err:#}"));
        }
    }

    // Re-read the approved record and spawn.
    let record = match approval_db::get_approval(deps.pool, id).await {
        Ok(Some(record)) => record,
        _ => {
            return ApprovalReply::rejected(
                ToolStatus::Error,
                format!("approval {} vanished after approve", short_id(id)),
            );
        }
    };

    match spawn_approved(deps, &record, approver).await {
        Ok(child) => {
            if let Err(err) =
                approval_db::set_spawn_linkage(deps.pool, id, &child.run_id, &child.session_key)
                    .await
            {
                tracing::warn!(approval_id = %id, error = %err, "failed to record spawn linkage");
            }
            tracing::info!(
                approval_id = %id,
                run_id = %child.run_id,
                approver,
                "approval spawned"
            );
            ApprovalReply::ok(
                id,
                format!("approved {}; child session started", short_id(id)),
            )
        }
        Err(err) => {
            let _ = approval_db::mark_spawn_failed(deps.pool, id).await;
            tracing::warn!(approval_id = %id, error = %err, "post-approval spawn failed");
            ApprovalReply::rejected(
                ToolStatus::Error,
                format!(
                    "approved {} but the spawn failed ({err}); approve again to retry",
                    short_id(id)
                ),
            )
        }
    }
}

/// Handle `/reject <shortId|uuid>`.
pub async fn reject(deps: &ApprovalDeps<'_>, input: &str, rejecter: &str) -> ApprovalReply {
    if !authorize(deps.config, rejecter) {
        return ApprovalReply::rejected(ToolStatus::Unauthorized, "you are not an authorized approver");
    }

    let record = match resolve_input(deps.pool, input).await {
        Ok(Resolved::Found(record)) => record,
        Ok(Resolved::NotFound) => {
            return ApprovalReply::rejected(ToolStatus::NotFound, format!("no approval matches {input:?}"));
        }
        Ok(Resolved::Ambiguous(n)) => {
            return ApprovalReply::rejected(
                ToolStatus::Error,
                format!("{n} approvals match {input:?}, use more characters"),
            );
        }
        Err(err) => {
            return ApprovalReply::rejected(ToolStatus::Error, format!("lookup failed: {err:#}"));
        }
    };

    reject_record(deps, record.id, rejecter).await
}

/// The rejection CAS core. `pending -> rejected` only; never overwrites an
/// approve that won the race.
pub async fn reject_record(deps: &ApprovalDeps<'_>, id: Uuid, rejecter: &str) -> ApprovalReply {
    match approval_db::cas_reject(deps.pool, id, rejecter).await {
        Ok(approval_db::CasOutcome::Applied) => {
            tracing::info!(approval_id = %id, rejecter, "approval rejected");
            ApprovalReply::ok(id, format!("rejected {}", short_id(id)))
        }
        Ok(approval_db::CasOutcome::AlreadyInStatus(status)) => ApprovalReply::rejected(
            ToolStatus::Error,
            format!("Job {} is already {status}", short_id(id)),
        ),
        Ok(approval_db::CasOutcome::Missing) => {
            ApprovalReply::rejected(ToolStatus::NotFound, format!("no approval {id}"))
        }
        Err(err) => ApprovalReply::rejected(ToolStatus::Error, format!("reject failed: {err:#}")),
    }
}

/// Pending approvals for `/pending`.
pub async fn pending(deps: &ApprovalDeps<'_>, limit: i64) -> anyhow::Result<Vec<ApprovalRecord>> {
    approval_db::list_pending(deps.pool, limit.clamp(1, 100)).await
}

// ---------------------------------------------------------------------------
// Approved-agent spawner
// ---------------------------------------------------------------------------

/// Launch the child for an approved record.
///
/// A human explicitly approved this dispatch, so the worker's depth,
/// fan-out, and allowlist checks do not apply: caller depth is fixed to 0
/// and the child runs at depth 1. The caller's primary session is the
/// announce requester. A tracking job is written so the spawn shows up in
/// status queries like any dispatched job.
async fn spawn_approved(
    deps: &ApprovalDeps<'_>,
    record: &ApprovalRecord,
    approver: &str,
) -> anyhow::Result<SpawnedChild> {
    let preamble = format!(
        "{} has approved this dispatch on behalf of {}.",
        text::sanitize(approver),
        text::sanitize(&record.caller),
    );
    let task = format!("{preamble}\n\n{}", record.task);

    let spec = SpawnSpec {
        target: record.target.clone(),
        task,
        child_depth: 1,
        model: record.model.clone(),
        thinking_level: record.thinking_level.clone(),
        system_prompt_addition: None,
        timeout_seconds: record.timeout_seconds,
        dispatched_by: record.caller.clone(),
        label: record.label.clone(),
        requester_session_key: Some(session::main_key(&record.caller)),
    };
    let child = spawn::launch_child(deps.host, deps.config, &spec)
        .await
        .map_err(|err| anyhow::anyhow!("{err:#}"))?;

    let tracking = NewJob {
        id: child.run_id.clone(),
        target: record.target.clone(),
        task: record.task.clone(),
        dispatched_by: record.caller.clone(),
        project: record.project.clone(),
        label: record.label.clone(),
        model: record.model.clone(),
        thinking_level: record.thinking_level.clone(),
        cleanup: record.cleanup.to_string(),
        depth: 0,
        timeout_seconds: record.timeout_seconds,
        launch_state: LaunchState::Launched,
        status: JobStatus::Queued,
        host_run_id: Some(child.run_id.clone()),
        host_session_key: Some(child.session_key.clone()),
        ..Default::default()
    };
    if job_db::insert_job(deps.pool, &tracking).await? {
        if let Err(err) = job_db::mark_job_active(
            deps.pool,
            &child.run_id,
            &child.run_id,
            &child.session_key,
        )
        .await
        {
            tracing::warn!(run_id = %child.run_id, error = %err, "failed to activate approval job");
        }
    }

    Ok(child)
}
