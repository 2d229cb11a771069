//! The single child-spawn routine shared by the worker pool and the
//! approved-agent spawner.
//!
//! Both paths allocate a session key, resolve model overrides, patch the
//! child session in one round-trip, build the subagent prompt, start the
//! session, and register it with the announce pipeline. They differ only in
//! the safety checks applied beforehand (the worker validates depth,
//! fan-out, and allowlists; a human approval replaces those checks), which
//! is why the routine takes a fully-resolved [`SpawnSpec`].

use thiserror::Error;

use crate::config::{OrchestratorConfig, resolve_model_overrides};
use crate::host::{HostError, SessionHost, SessionPatch, StartSessionSpec};
use crate::session;

/// Launch failures split by retry eligibility.
///
/// Unrecoverable errors (bad configuration, depth/allowlist violations)
/// bypass the queue's launch retries; recoverable errors get the standard
/// backoff schedule.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{0}")]
    Unrecoverable(String),
    #[error(transparent)]
    Recoverable(#[from] anyhow::Error),
}

impl LaunchError {
    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        Self::Unrecoverable(msg.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

impl From<HostError> for LaunchError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Auth(msg) => Self::Unrecoverable(format!("host auth failure: {msg}")),
            other => Self::Recoverable(anyhow::Error::new(other)),
        }
    }
}

/// Fully-resolved parameters for launching one child session.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub target: String,
    pub task: String,
    /// Depth recorded on the child (caller depth + 1).
    pub child_depth: i32,
    /// Job-level model override, start of the resolution chain.
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub system_prompt_addition: Option<String>,
    pub timeout_seconds: Option<i32>,
    /// Who dispatched this work, for the subagent preamble.
    pub dispatched_by: String,
    pub label: Option<String>,
    /// Session whose announce pipeline receives the result.
    pub requester_session_key: Option<String>,
}

/// A successfully launched child.
#[derive(Debug, Clone)]
pub struct SpawnedChild {
    pub run_id: String,
    pub session_key: String,
}

/// Clamp a requested run timeout into the supported range.
pub fn clamp_timeout_seconds(requested: Option<i32>) -> Option<i32> {
    requested.map(|t| t.clamp(30, 86_400))
}

/// Build the system prompt for a child session.
pub fn build_subagent_prompt(spec: &SpawnSpec) -> String {
    let mut prompt = format!(
        "You are a subagent of {target}, working on behalf of {dispatcher}.",
        target = spec.target,
        dispatcher = spec.dispatched_by,
    );
    if let Some(label) = &spec.label {
        prompt.push_str(&format!(" This run is labelled \"{label}\"."));
    }
    prompt.push_str(
        " Complete the task you were given and report the outcome; \
         your result is announced back to the requester automatically.",
    );
    if let Some(addition) = &spec.system_prompt_addition {
        prompt.push_str("\n\n");
        prompt.push_str(addition);
    }
    prompt
}

/// Launch a child session (worker launch steps 6-11).
///
/// The combined depth/model patch is a single round-trip; when the host
/// rejects the model specifically, the patch is retried without the model
/// field before giving up.
pub async fn launch_child(
    host: &dyn SessionHost,
    config: &OrchestratorConfig,
    spec: &SpawnSpec,
) -> Result<SpawnedChild, LaunchError> {
    // 6. Allocate the child session key.
    let session_key = session::subagent_key(&spec.target);

    // 7. Resolve model/thinking overrides through the layered fallback.
    let target_cfg = config.agent(&spec.target);
    let (model, thinking_level) = resolve_model_overrides(
        config,
        target_cfg,
        spec.model.as_deref(),
        spec.thinking_level.as_deref(),
    );

    // 8. Patch depth and overrides in one round-trip; retry without the
    //    model on a model rejection.
    let patch = SessionPatch {
        depth: Some(spec.child_depth),
        model: model.clone(),
        thinking_level: thinking_level.clone(),
    };
    match host.patch_session(&session_key, &patch).await {
        Ok(()) => {}
        Err(err) if err.is_model_rejection() && patch.model.is_some() => {
            tracing::warn!(
                session_key = %session::display_key(&session_key),
                error = %err,
                "model rejected, retrying patch without model"
            );
            let retry = SessionPatch {
                depth: Some(spec.child_depth),
                model: None,
                thinking_level,
            };
            host.patch_session(&session_key, &retry).await?;
        }
        Err(err) => return Err(err.into()),
    }

    // 9. Build the subagent system prompt.
    let system_prompt = build_subagent_prompt(spec);

    // 10. Start the child. The announce pipeline handles delivery, so the
    //     host must not deliver the result itself.
    let start = StartSessionSpec {
        session_key: session_key.clone(),
        agent_id: spec.target.clone(),
        task: spec.task.clone(),
        system_prompt: Some(system_prompt),
        deliver: false,
        timeout_seconds: clamp_timeout_seconds(spec.timeout_seconds),
    };
    let run_id = host.start_session(&start).await?;

    // 11. Register with the announce pipeline so the result routes back.
    if let Some(requester) = &spec.requester_session_key {
        host.register_subagent_run(&run_id, requester).await?;
    }

    Ok(SpawnedChild {
        run_id,
        session_key,
    })
}
