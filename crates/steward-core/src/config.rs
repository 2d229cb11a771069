//! Orchestrator configuration: the agent registry, queue tuning, and the
//! breaker/rate/retry/approval sections.

use serde::{Deserialize, Serialize};

/// Hard cap on dispatched task length, in characters.
pub const MAX_TASK_CHARS: usize = 50_000;
/// Hard cap on the number of `depends_on` references per job.
pub const MAX_DEPENDS_ON: usize = 20;
/// Captured result cap, in characters.
pub const MAX_RESULT_CHARS: usize = 5_000;
/// Learning entry cap, in characters.
pub const MAX_LEARNING_CHARS: usize = 1_024;
/// Learning tag-count cap.
pub const MAX_LEARNING_TAGS: usize = 10;
/// Approval notification cap, in characters (applied after sanitization).
pub const MAX_NOTIFICATION_CHARS: usize = 500;
/// DLQ alert cap, in characters.
pub const MAX_ALERT_CHARS: usize = 200;

/// One configured agent. Each agent gets its own work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    /// Targets this agent may dispatch to. `"*"` is the wildcard.
    #[serde(default)]
    pub allow_agents: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub thinking_level: Option<String>,
    /// Overrides applied to children spawned *for* this agent.
    #[serde(default)]
    pub subagent_model: Option<String>,
    #[serde(default)]
    pub subagent_thinking_level: Option<String>,
}

impl AgentConfig {
    /// Whether this agent may dispatch to `target`.
    pub fn allows(&self, target: &str) -> bool {
        self.id == target
            || self
                .allow_agents
                .iter()
                .any(|a| a == "*" || a == target)
    }
}

/// Fleet-wide model fallbacks, the last layers of the resolution chain
/// (job > target subagent > default subagent > default primary > platform).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDefaults {
    pub subagent_model: Option<String>,
    pub subagent_thinking_level: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Milliseconds until the half-open probe.
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Dispatch rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-caller cap; 0 disables the limit.
    pub dispatches_per_minute: i64,
    /// Per-target queue-depth cap.
    pub max_queue_depth: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            dispatches_per_minute: 10,
            max_queue_depth: 50,
        }
    }
}

/// Agent-level (execution-failure) retry tuning. Distinct from the queue's
/// launch-retry policy in [`QueueTuning`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub agent_failure_attempts: u32,
    pub agent_failure_base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            agent_failure_attempts: 3,
            agent_failure_base_delay_ms: 300_000,
        }
    }
}

/// Spawn-tree limits enforced by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnLimits {
    pub max_spawn_depth: i32,
    pub max_children_per_agent: i64,
}

impl Default for SpawnLimits {
    fn default() -> Self {
        Self {
            max_spawn_depth: 3,
            max_children_per_agent: 5,
        }
    }
}

/// Human-approval gating.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Callers exempt from the approval gate.
    pub orchestrators: Vec<String>,
    /// Ids permitted to approve/reject. Empty means nobody (fail-secure).
    pub authorized_approvers: Vec<String>,
    /// Channel for approval notifications. Approval-routed dispatches are
    /// rejected outright when unset rather than orphaned.
    pub channel_id: Option<String>,
    pub ttl_days: Option<f64>,
}

impl ApprovalConfig {
    pub fn ttl_days(&self) -> f64 {
        self.ttl_days.unwrap_or(7.0)
    }
}

/// Learning-index tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningsConfig {
    pub ttl_days: Option<f64>,
}

impl LearningsConfig {
    pub fn ttl_days(&self) -> f64 {
        self.ttl_days.unwrap_or(365.0)
    }
}

/// DLQ / terminal-failure alerting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub channel_id: Option<String>,
}

/// Read-only monitoring endpoint. An empty token disables the endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub auth_token: String,
}

/// Per-queue tuning. These constants carry the design's safety guarantees;
/// in particular the launch lock must outlast the whole launch sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueTuning {
    /// Launch lock. A child-session launch runs long; a shorter lock causes
    /// false stalls and double-launches. Values below the default are
    /// clamped back up at load.
    pub lock_secs: f64,
    /// Interval of the stall-flagging sweep.
    pub stall_check_secs: u64,
    /// Stalled reclaims allowed before dead-lettering.
    pub max_stalled_count: i32,
    /// Launch attempts before dead-lettering (launch failures only).
    pub launch_attempts: i32,
    /// Exponential backoff base for launch retries.
    pub launch_backoff_base_secs: f64,
    pub completed_retention_days: f64,
    pub completed_keep: i64,
    pub failed_retention_days: f64,
    pub failed_keep: i64,
    /// Gate lock, strictly greater than the polling cap plus buffer.
    pub gate_lock_secs: f64,
    pub gate_poll_secs: f64,
    /// Hard cap on one gate's polling window.
    pub gate_timeout_secs: f64,
    pub gate_concurrency: usize,
    pub gate_max_attempts: i32,
    /// Idle poll interval of each agent worker.
    pub worker_poll_ms: u64,
    pub cleanup_interval_secs: u64,
}

impl QueueTuning {
    /// The floor for `lock_secs`.
    pub const MIN_LOCK_SECS: f64 = 300.0;
}

impl Default for QueueTuning {
    fn default() -> Self {
        Self {
            lock_secs: 300.0,
            stall_check_secs: 180,
            max_stalled_count: 2,
            launch_attempts: 3,
            launch_backoff_base_secs: 5.0,
            completed_retention_days: 7.0,
            completed_keep: 1_000,
            failed_retention_days: 30.0,
            failed_keep: 5_000,
            gate_lock_secs: 2_100.0,
            gate_poll_secs: 5.0,
            gate_timeout_secs: 1_800.0,
            gate_concurrency: 10,
            gate_max_attempts: 3,
            worker_poll_ms: 500,
            cleanup_interval_secs: 3_600,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub agents: Vec<AgentConfig>,
    /// Privileged identities: cross-agent visibility, system prompt
    /// additions, learning writes.
    pub system_agents: Vec<String>,
    pub models: ModelDefaults,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub limits: SpawnLimits,
    pub approval: ApprovalConfig,
    pub learnings: LearningsConfig,
    pub alerts: AlertsConfig,
    pub monitor: MonitorConfig,
    pub queue: QueueTuning,
}

impl OrchestratorConfig {
    /// Look up an agent's configuration entry.
    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn is_orchestrator(&self, id: &str) -> bool {
        self.approval.orchestrators.iter().any(|o| o == id)
    }

    pub fn is_system_agent(&self, id: &str) -> bool {
        self.system_agents.iter().any(|s| s == id)
    }

    /// Enforce load-time invariants (currently: the launch-lock floor).
    pub fn validated(mut self) -> Self {
        if self.queue.lock_secs < QueueTuning::MIN_LOCK_SECS {
            tracing::warn!(
                configured = self.queue.lock_secs,
                floor = QueueTuning::MIN_LOCK_SECS,
                "queue.lock_secs below the floor, clamping up"
            );
            self.queue.lock_secs = QueueTuning::MIN_LOCK_SECS;
        }
        self
    }
}

/// Resolve the model and thinking-level overrides for a child session.
///
/// Layered fallback: job-level override, then the target agent's subagent
/// override, then the fleet subagent default, then the fleet primary
/// default. `None` means the platform default applies.
pub fn resolve_model_overrides(
    config: &OrchestratorConfig,
    target: Option<&AgentConfig>,
    job_model: Option<&str>,
    job_thinking: Option<&str>,
) -> (Option<String>, Option<String>) {
    let model = job_model
        .map(str::to_owned)
        .or_else(|| target.and_then(|t| t.subagent_model.clone()))
        .or_else(|| config.models.subagent_model.clone())
        .or_else(|| config.models.model.clone());
    let thinking = job_thinking
        .map(str::to_owned)
        .or_else(|| target.and_then(|t| t.subagent_thinking_level.clone()))
        .or_else(|| config.models.subagent_thinking_level.clone())
        .or_else(|| config.models.thinking_level.clone());
    (model, thinking)
}
