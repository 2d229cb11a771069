//! Dispatcher-facing read tools: `status`, `list`, and `activity`.
//!
//! All replies are structured and authorization-filtered: a non-system
//! caller sees only jobs it dispatched or is the target of, and the
//! session-host linkage key is stripped from its views.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use steward_db::models::{JobRecord, JobStatus, LaunchState};
use steward_db::queries::approvals as approval_db;
use steward_db::queries::gates as gate_db;
use steward_db::queries::jobs::{self as job_db, JobFilter};

use crate::config::OrchestratorConfig;
use crate::dispatch::ToolStatus;
use crate::identity::CallerIdentity;
use crate::text;

/// A job record projected to the fields a caller is authorized to see.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub target: String,
    pub dispatched_by: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub task: String,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retried_by_job_id: Option<String>,
    /// Present only on jobs created with dependencies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_for_dependencies: Option<bool>,
    /// Stripped for non-system callers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

impl JobView {
    /// Project a record for a caller, stripping the session linkage unless
    /// the caller is a system agent.
    pub fn project(job: &JobRecord, identity: &CallerIdentity) -> Self {
        Self {
            job_id: job.id.clone(),
            target: job.target.clone(),
            dispatched_by: job.dispatched_by.clone(),
            status: job.status,
            label: job.label.clone(),
            project: job.project.clone(),
            task: text::truncate_with_ellipsis(&job.task, 200),
            queued_at: job.queued_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            result: job.result.clone(),
            error: job.error.clone(),
            retry_count: job.retry_count,
            original_job_id: job.original_job_id.clone(),
            retried_by_job_id: job.retried_by_job_id.clone(),
            waiting_for_dependencies: None,
            session_key: if identity.is_system {
                job.host_session_key.clone()
            } else {
                None
            },
        }
    }
}

/// Reply for the `status` tool.
#[derive(Debug, Serialize)]
pub struct StatusReply {
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Look up one job, authorization-checked.
pub async fn status(
    pool: &PgPool,
    config: &OrchestratorConfig,
    caller: &str,
    job_id: &str,
) -> StatusReply {
    let identity = CallerIdentity::resolve(config, caller);

    let job = match job_db::get_job(pool, job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            return StatusReply {
                status: ToolStatus::NotFound,
                job: None,
                error: Some(format!("job {job_id} not found")),
            };
        }
        Err(err) => {
            return StatusReply {
                status: ToolStatus::Error,
                job: None,
                error: Some(format!("lookup failed: {err:#}")),
            };
        }
    };

    if !identity.can_view(&job) {
        // Authorization non-leakage: an invisible job reads as absent.
        return StatusReply {
            status: ToolStatus::NotFound,
            job: None,
            error: Some(format!("job {job_id} not found")),
        };
    }

    let mut view = JobView::project(&job, &identity);
    match gate_db::gates_for_parent(pool, &job.id).await {
        Ok(gates) if !gates.is_empty() => {
            view.waiting_for_dependencies = Some(job.launch_state == LaunchState::WaitingDeps);
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(job_id = %job.id, error = %err, "gate lookup failed");
        }
    }

    StatusReply {
        status: ToolStatus::Ok,
        job: Some(view),
        error: None,
    }
}

/// Inputs to the `list` tool.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    pub agent: Option<String>,
    /// One of: queued, active, completed, failed, pending_approval.
    pub status: Option<String>,
    pub project: Option<String>,
    pub limit: Option<i64>,
}

/// Reply for the `list` tool.
#[derive(Debug, Serialize)]
pub struct ListReply {
    pub status: ToolStatus,
    pub jobs: Vec<JobView>,
    pub count: usize,
    pub limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn status_classes(filter: &str) -> Option<Vec<JobStatus>> {
    match filter {
        "queued" => Some(vec![JobStatus::Queued, JobStatus::Stalled]),
        "active" => Some(vec![JobStatus::Active, JobStatus::Announcing]),
        "completed" => Some(vec![JobStatus::Completed]),
        "failed" => Some(vec![
            JobStatus::Failed,
            JobStatus::FailedPermanent,
            JobStatus::Retrying,
        ]),
        _ => None,
    }
}

/// List jobs with filters, authorization-scoped.
pub async fn list(
    pool: &PgPool,
    config: &OrchestratorConfig,
    caller: &str,
    params: ListParams,
) -> ListReply {
    let identity = CallerIdentity::resolve(config, caller);
    let limit = params.limit.unwrap_or(20).clamp(1, 100);

    // Pending approvals are a different entity; surface them through the
    // same tool shape.
    if params.status.as_deref() == Some("pending_approval") {
        let pending = match approval_db::list_pending(pool, limit).await {
            Ok(records) => records,
            Err(err) => {
                return ListReply {
                    status: ToolStatus::Error,
                    jobs: Vec::new(),
                    count: 0,
                    limit,
                    error: Some(format!("list failed: {err:#}")),
                };
            }
        };
        let jobs: Vec<JobView> = pending
            .iter()
            .filter(|a| identity.is_system || a.caller == caller || a.target == caller)
            .map(|a| JobView {
                job_id: a.id.to_string(),
                target: a.target.clone(),
                dispatched_by: a.caller.clone(),
                status: JobStatus::Queued,
                label: a.label.clone(),
                project: a.project.clone(),
                task: text::truncate_with_ellipsis(&a.task, 200),
                queued_at: a.created_at,
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
                retry_count: 0,
                original_job_id: None,
                retried_by_job_id: None,
                waiting_for_dependencies: None,
                session_key: None,
            })
            .collect();
        let count = jobs.len();
        return ListReply {
            status: ToolStatus::Ok,
            jobs,
            count,
            limit,
            error: None,
        };
    }

    let statuses = match params.status.as_deref() {
        None => None,
        Some(filter) => match status_classes(filter) {
            Some(classes) => Some(classes),
            None => {
                return ListReply {
                    status: ToolStatus::Error,
                    jobs: Vec::new(),
                    count: 0,
                    limit,
                    error: Some(format!("unknown status filter: {filter:?}")),
                };
            }
        },
    };

    let filter = JobFilter {
        target: params.agent.as_deref(),
        statuses: statuses.as_deref(),
        project: params.project.as_deref(),
        dispatched_by_or_target: (!identity.is_system).then_some(caller),
        limit,
    };

    match job_db::list_jobs(pool, &filter).await {
        Ok(records) => {
            let jobs: Vec<JobView> = records
                .iter()
                .map(|j| JobView::project(j, &identity))
                .collect();
            let count = jobs.len();
            ListReply {
                status: ToolStatus::Ok,
                jobs,
                count,
                limit,
                error: None,
            }
        }
        Err(err) => ListReply {
            status: ToolStatus::Error,
            jobs: Vec::new(),
            count: 0,
            limit,
            error: Some(format!("list failed: {err:#}")),
        },
    }
}

/// Per-agent activity snapshot.
#[derive(Debug, Serialize)]
pub struct AgentActivity {
    /// working | idle | offline
    pub status: &'static str,
    pub pending: i64,
    pub active: i64,
    pub completed_total: i64,
    pub failed_total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

/// Reply for the `activity` tool.
#[derive(Debug, Serialize)]
pub struct ActivityReply {
    pub status: ToolStatus,
    pub agents: BTreeMap<String, AgentActivity>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fleet activity overview: one entry per configured agent, plus `offline`
/// entries for queues whose agent is no longer configured.
pub async fn activity(pool: &PgPool, config: &OrchestratorConfig) -> ActivityReply {
    let mut targets: Vec<(String, bool)> = config
        .agents
        .iter()
        .map(|a| (a.id.clone(), true))
        .collect();
    match job_db::known_targets(pool).await {
        Ok(known) => {
            for target in known {
                if !targets.iter().any(|(id, _)| *id == target) {
                    targets.push((target, false));
                }
            }
        }
        Err(err) => {
            return ActivityReply {
                status: ToolStatus::Error,
                agents: BTreeMap::new(),
                summary: String::new(),
                error: Some(format!("activity failed: {err:#}")),
            };
        }
    }

    let current = match job_db::current_jobs_by_target(pool).await {
        Ok(jobs) => jobs,
        Err(err) => {
            return ActivityReply {
                status: ToolStatus::Error,
                agents: BTreeMap::new(),
                summary: String::new(),
                error: Some(format!("activity failed: {err:#}")),
            };
        }
    };

    let now = Utc::now();
    let mut agents = BTreeMap::new();
    let mut working = 0usize;
    let mut queued_total = 0i64;

    for (target, configured) in targets {
        let stats = match job_db::queue_stats(pool, &target).await {
            Ok(stats) => stats,
            Err(err) => {
                tracing::warn!(target = %target, error = %err, "queue stats failed");
                continue;
            }
        };
        let current_job = current.iter().find(|j| j.target == target);
        let status = if !configured {
            "offline"
        } else if stats.active > 0 {
            working += 1;
            "working"
        } else {
            "idle"
        };
        queued_total += stats.waiting + stats.delayed + stats.waiting_deps;

        agents.insert(
            target,
            AgentActivity {
                status,
                pending: stats.waiting + stats.delayed + stats.waiting_deps,
                active: stats.active,
                completed_total: stats.completed,
                failed_total: stats.failed,
                job: current_job.map(|j| {
                    j.label
                        .clone()
                        .unwrap_or_else(|| text::truncate_with_ellipsis(&j.task, 80))
                }),
                since: current_job
                    .and_then(|j| j.started_at)
                    .map(|at| text::format_relative(at, now)),
            },
        );
    }

    let summary = format!(
        "{} agents, {working} working, {queued_total} jobs queued",
        agents.len()
    );

    ActivityReply {
        status: ToolStatus::Ok,
        agents,
        summary,
        error: None,
    }
}
