//! Interfaces to the external collaborators: the session host (the runtime
//! that actually executes agent sessions and routes announcements) and the
//! chat-platform message sender.
//!
//! The core never executes model calls; everything it needs from the agent
//! runtime goes through [`SessionHost`]. Both traits are object-safe so the
//! service can hold them as `Arc<dyn ...>`.

use async_trait::async_trait;
use thiserror::Error;

/// Typed classification of session-host and sender failures.
///
/// The variants callers actually branch on: `Auth` force-opens the circuit
/// breaker, `ModelRejected` triggers the patch-without-model retry, and
/// `Transient` is eligible for launch retries.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("authentication failure: {0}")]
    Auth(String),
    #[error("model rejected: {0}")]
    ModelRejected(String),
    #[error("transient host error: {0}")]
    Transient(String),
    #[error("{0}")]
    Other(String),
}

impl HostError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub fn is_model_rejection(&self) -> bool {
        matches!(self, Self::ModelRejected(_))
    }
}

/// Parameters for starting a child session.
#[derive(Debug, Clone)]
pub struct StartSessionSpec {
    pub session_key: String,
    pub agent_id: String,
    pub task: String,
    pub system_prompt: Option<String>,
    /// Whether the host should deliver the result itself. The worker always
    /// passes `false`; the announce pipeline handles delivery independently.
    pub deliver: bool,
    pub timeout_seconds: Option<i32>,
}

/// A partial update applied to a session in a single round-trip.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub depth: Option<i32>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
}

/// One message from a session's history.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// The session host: starts, patches, and inspects agent sessions.
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Start a session; returns the host's run id.
    async fn start_session(&self, spec: &StartSessionSpec) -> Result<String, HostError>;

    /// Apply a combined patch (depth + optional model/thinking) to a
    /// session in one round-trip.
    async fn patch_session(&self, session_key: &str, patch: &SessionPatch)
    -> Result<(), HostError>;

    /// Send a text message into a running session.
    async fn send_to_session(&self, session_key: &str, message: &str) -> Result<(), HostError>;

    /// Fetch a session's message history (for result capture).
    async fn fetch_session_history(
        &self,
        session_key: &str,
    ) -> Result<Vec<HistoryMessage>, HostError>;

    /// Register a spawned run with the announce pipeline so its result
    /// routes back to the requester session.
    async fn register_subagent_run(
        &self,
        run_id: &str,
        requester_session_key: &str,
    ) -> Result<(), HostError>;

    /// Resolve the spawn depth recorded on a session, if any.
    async fn session_depth(&self, session_key: &str) -> Result<Option<i32>, HostError>;
}

/// Chat-platform delivery for approval notifications and DLQ alerts.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send a message; returns the platform message id.
    async fn send(
        &self,
        channel: &str,
        target: &str,
        content: &str,
        idempotency_key: &str,
    ) -> Result<String, HostError>;

    /// Remove a reaction from a message. `user_id` of `None` removes the
    /// bot's own reaction.
    async fn remove_reaction(
        &self,
        channel: &str,
        message_id: &str,
        emoji: &str,
        user_id: Option<&str>,
    ) -> Result<(), HostError>;
}

// Compile-time assertion: both traits must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn SessionHost, _: &dyn MessageSender) {}
};
