use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Execution status of a job, written by the lifecycle hooks.
///
/// This is the *agent-execution* lifecycle, distinct from [`LaunchState`]
/// which tracks the queue's dispatch-launch lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Active,
    Announcing,
    Completed,
    Failed,
    FailedPermanent,
    Retrying,
    Stalled,
}

impl JobStatus {
    /// Terminal statuses never transition again. `retrying` is terminal for
    /// the record itself: the retry continues under a new job id linked via
    /// `retried_by_job_id`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::FailedPermanent | Self::Retrying
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Announcing => "announcing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedPermanent => "failed_permanent",
            Self::Retrying => "retrying",
            Self::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "announcing" => Ok(Self::Announcing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "failed_permanent" => Ok(Self::FailedPermanent),
            "retrying" => Ok(Self::Retrying),
            "stalled" => Ok(Self::Stalled),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Dispatch-launch state of a job, owned by the queue infrastructure.
///
/// `launched` means the child session was started; it says nothing about
/// whether the child *execution* succeeded (see [`JobStatus`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    /// Parent of a dependency flow, blocked until every gate completes.
    WaitingDeps,
    #[default]
    Queued,
    /// Scheduled for a later `run_at` (launch-retry backoff).
    Delayed,
    /// Claimed by a worker holding the lock.
    Launching,
    Launched,
    /// Launch retries exhausted.
    DeadLetter,
}

impl fmt::Display for LaunchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WaitingDeps => "waiting_deps",
            Self::Queued => "queued",
            Self::Delayed => "delayed",
            Self::Launching => "launching",
            Self::Launched => "launched",
            Self::DeadLetter => "dead_letter",
        };
        f.write_str(s)
    }
}

impl FromStr for LaunchState {
    type Err = LaunchStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting_deps" => Ok(Self::WaitingDeps),
            "queued" => Ok(Self::Queued),
            "delayed" => Ok(Self::Delayed),
            "launching" => Ok(Self::Launching),
            "launched" => Ok(Self::Launched),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(LaunchStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LaunchState`] string.
#[derive(Debug, Clone)]
pub struct LaunchStateParseError(pub String);

impl fmt::Display for LaunchStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid launch state: {:?}", self.0)
    }
}

impl std::error::Error for LaunchStateParseError {}

// ---------------------------------------------------------------------------

/// State of a dependency gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for GateState {
    type Err = GateStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(GateStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GateState`] string.
#[derive(Debug, Clone)]
pub struct GateStateParseError(pub String);

impl fmt::Display for GateStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid gate state: {:?}", self.0)
    }
}

impl std::error::Error for GateStateParseError {}

// ---------------------------------------------------------------------------

/// Status of a human-approval record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    /// Approved, but the post-approval spawn failed; re-approvable.
    ApprovedSpawnFailed,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::ApprovedSpawnFailed => "approved_spawn_failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ApprovalStatus {
    type Err = ApprovalStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            "approved_spawn_failed" => Ok(Self::ApprovedSpawnFailed),
            other => Err(ApprovalStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ApprovalStatus`] string.
#[derive(Debug, Clone)]
pub struct ApprovalStatusParseError(pub String);

impl fmt::Display for ApprovalStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid approval status: {:?}", self.0)
    }
}

impl std::error::Error for ApprovalStatusParseError {}

// ---------------------------------------------------------------------------

/// What to do with the child session once its job is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    Delete,
    #[default]
    Keep,
}

impl CleanupMode {
    /// Coerce a loosely-typed value ("delete"/"keep", anything else -> keep).
    pub fn coerce(s: Option<&str>) -> Self {
        match s {
            Some("delete") => Self::Delete,
            _ => Self::Keep,
        }
    }
}

impl fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Delete => "delete",
            Self::Keep => "keep",
        };
        f.write_str(s)
    }
}

impl FromStr for CleanupMode {
    type Err = CleanupModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete" => Ok(Self::Delete),
            "keep" => Ok(Self::Keep),
            other => Err(CleanupModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CleanupMode`] string.
#[derive(Debug, Clone)]
pub struct CleanupModeParseError(pub String);

impl fmt::Display for CleanupModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cleanup mode: {:?}", self.0)
    }
}

impl std::error::Error for CleanupModeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A job -- one dispatched unit of agent work.
///
/// `id` is TEXT, not UUID: the dispatch tool generates UUIDs, but the
/// backward-compatibility hook tracks jobs under the session host's run id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRecord {
    pub id: String,
    /// Root of a retry chain; equals `id` for non-retry jobs.
    pub original_job_id: Option<String>,
    /// Forward pointer to the job that retried this one.
    pub retried_by_job_id: Option<String>,
    pub target: String,
    pub task: String,
    pub dispatched_by: String,
    pub project: Option<String>,
    pub label: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub system_prompt_addition: Option<String>,
    pub cleanup: CleanupMode,
    pub depth: i32,
    pub status: JobStatus,
    pub launch_state: LaunchState,
    pub launch_attempts: i32,
    pub stalled_count: i32,
    /// Earliest time the launch may be claimed (delayed/retry jobs).
    pub run_at: DateTime<Utc>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub dispatcher_session_key: Option<String>,
    pub dispatcher_depth: Option<i32>,
    pub dispatcher_channel: Option<String>,
    pub dispatcher_account_id: Option<String>,
    pub dispatcher_to: Option<String>,
    pub dispatcher_thread_id: Option<String>,
    pub host_run_id: Option<String>,
    pub host_session_key: Option<String>,
    pub timeout_seconds: Option<i32>,
    pub retry_count: i32,
    pub store_result: bool,
}

/// A dependency gate -- a lightweight child blocking a parent job on one
/// other job's completion.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DepGate {
    pub id: Uuid,
    pub parent_job_id: String,
    pub dependency_job_id: String,
    pub parent_target: String,
    pub state: GateState,
    pub attempts: i32,
    pub run_at: DateTime<Utc>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A human-approval record for a gated dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub status: ApprovalStatus,
    pub caller: String,
    pub target: String,
    /// Full, untruncated task text.
    pub task: String,
    pub label: Option<String>,
    pub project: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub timeout_seconds: Option<i32>,
    pub cleanup: CleanupMode,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub notification_message_id: Option<String>,
    pub notification_channel_id: Option<String>,
    pub spawn_run_id: Option<String>,
    pub spawn_session_key: Option<String>,
}

/// An append-only, project-scoped learning entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LearningEntry {
    pub id: Uuid,
    pub job_id: String,
    pub previous_job_id: Option<String>,
    pub project_id: String,
    pub phase: Option<String>,
    pub agent_id: String,
    pub learning: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_display_roundtrip() {
        let variants = [
            JobStatus::Queued,
            JobStatus::Active,
            JobStatus::Announcing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::FailedPermanent,
            JobStatus::Retrying,
            JobStatus::Stalled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: JobStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn job_status_invalid() {
        let result = "bogus".parse::<JobStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn job_status_terminality() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::FailedPermanent.is_terminal());
        assert!(JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Stalled.is_terminal());
    }

    #[test]
    fn launch_state_display_roundtrip() {
        let variants = [
            LaunchState::WaitingDeps,
            LaunchState::Queued,
            LaunchState::Delayed,
            LaunchState::Launching,
            LaunchState::Launched,
            LaunchState::DeadLetter,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: LaunchState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn gate_state_display_roundtrip() {
        let variants = [
            GateState::Pending,
            GateState::Running,
            GateState::Completed,
            GateState::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: GateState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn approval_status_display_roundtrip() {
        let variants = [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Expired,
            ApprovalStatus::ApprovedSpawnFailed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ApprovalStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn approval_status_invalid() {
        let result = "granted".parse::<ApprovalStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn cleanup_mode_coercion() {
        assert_eq!(CleanupMode::coerce(Some("delete")), CleanupMode::Delete);
        assert_eq!(CleanupMode::coerce(Some("keep")), CleanupMode::Keep);
        assert_eq!(CleanupMode::coerce(Some("purge")), CleanupMode::Keep);
        assert_eq!(CleanupMode::coerce(None), CleanupMode::Keep);
    }
}
