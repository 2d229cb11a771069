//! The learning index: an append-only, project-scoped knowledge store
//! agents use to pass lessons between jobs.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use steward_db::models::LearningEntry;
use steward_db::queries::learnings as learning_db;

use crate::config::{MAX_LEARNING_CHARS, MAX_LEARNING_TAGS, OrchestratorConfig};
use crate::dispatch::ToolStatus;
use crate::identity::CallerIdentity;

/// Inputs to the `add_learning` tool.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AddLearningParams {
    pub project_id: String,
    pub job_id: String,
    pub learning: String,
    pub tags: Vec<String>,
    pub previous_job_id: Option<String>,
    pub phase: Option<String>,
}

/// Reply for `add_learning`.
#[derive(Debug, Serialize)]
pub struct AddLearningReply {
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AddLearningReply {
    fn rejected(status: ToolStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            id: None,
            project_id: None,
            job_id: None,
            tags: None,
            error: Some(error.into()),
        }
    }
}

/// Append a learning entry. System agents only.
pub async fn add_learning(
    pool: &PgPool,
    config: &OrchestratorConfig,
    caller: &str,
    params: AddLearningParams,
) -> AddLearningReply {
    let identity = CallerIdentity::resolve(config, caller);
    if !identity.is_system {
        return AddLearningReply::rejected(
            ToolStatus::Unauthorized,
            "add_learning is restricted to system agents",
        );
    }
    if params.project_id.is_empty() || params.job_id.is_empty() {
        return AddLearningReply::rejected(ToolStatus::Error, "project_id and job_id are required");
    }
    let learning_chars = params.learning.chars().count();
    if learning_chars == 0 || learning_chars > MAX_LEARNING_CHARS {
        return AddLearningReply::rejected(
            ToolStatus::Error,
            format!("learning must be 1..={MAX_LEARNING_CHARS} characters, got {learning_chars}"),
        );
    }
    if params.tags.len() > MAX_LEARNING_TAGS {
        return AddLearningReply::rejected(
            ToolStatus::Error,
            format!(
                "at most {MAX_LEARNING_TAGS} tags allowed, got {}",
                params.tags.len()
            ),
        );
    }

    let entry = learning_db::NewLearning {
        id: Uuid::new_v4(),
        job_id: params.job_id.clone(),
        previous_job_id: params.previous_job_id.clone(),
        project_id: params.project_id.clone(),
        phase: params.phase.clone(),
        agent_id: caller.to_owned(),
        learning: params.learning.clone(),
        tags: params.tags.clone(),
        ttl_days: config.learnings.ttl_days(),
    };

    match learning_db::insert_learning(pool, &entry).await {
        Ok(record) => AddLearningReply {
            status: ToolStatus::Ok,
            id: Some(record.id.to_string()),
            project_id: Some(record.project_id),
            job_id: Some(record.job_id),
            tags: Some(record.tags),
            error: None,
        },
        Err(err) => AddLearningReply::rejected(ToolStatus::Error, format!("insert failed: {err:#}")),
    }
}

/// Inputs to the `learnings` tool. Exactly one of `project_id`/`job_id` is
/// required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LearningsParams {
    pub project_id: Option<String>,
    pub job_id: Option<String>,
    pub tags: Vec<String>,
    pub limit: Option<i64>,
}

/// Reply for `learnings`.
#[derive(Debug, Serialize)]
pub struct LearningsReply {
    pub status: ToolStatus,
    pub entries: Vec<LearningEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// List learnings for a project (newest first) or a job (insertion order).
pub async fn learnings(pool: &PgPool, params: LearningsParams) -> LearningsReply {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let tags = (!params.tags.is_empty()).then_some(params.tags.as_slice());

    let result = match (&params.project_id, &params.job_id) {
        (Some(project_id), None) => {
            learning_db::list_for_project(pool, project_id, tags, limit).await
        }
        (None, Some(job_id)) => learning_db::list_for_job(pool, job_id, tags, limit).await,
        _ => {
            return LearningsReply {
                status: ToolStatus::Error,
                entries: Vec::new(),
                error: Some("exactly one of project_id or job_id is required".to_owned()),
            };
        }
    };

    match result {
        Ok(entries) => LearningsReply {
            status: ToolStatus::Ok,
            entries,
            error: None,
        },
        Err(err) => LearningsReply {
            status: ToolStatus::Error,
            entries: Vec::new(),
            error: Some(format!("list failed: {err:#}")),
        },
    }
}
