//! Session-key conventions.
//!
//! Child sessions are keyed `agent:{agentId}:subagent:{uuid}`; an agent's
//! own primary session is `agent:{agentId}:main`.

use uuid::Uuid;

/// Allocate a fresh subagent session key for a target agent.
pub fn subagent_key(target: &str) -> String {
    format!("agent:{target}:subagent:{}", Uuid::new_v4())
}

/// The primary session key for an agent.
pub fn main_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:main")
}

/// Extract the agent id from a session key, if it follows the convention.
pub fn agent_of(session_key: &str) -> Option<&str> {
    let rest = session_key.strip_prefix("agent:")?;
    let end = rest.find(':')?;
    let id = &rest[..end];
    (!id.is_empty()).then_some(id)
}

/// Short display form of a session key: subagent UUIDs are cut to their
/// first group so log lines and prompts stay readable.
pub fn display_key(session_key: &str) -> String {
    match session_key.rsplit_once(':') {
        Some((head, tail)) if tail.len() == 36 && tail.matches('-').count() == 4 => {
            format!("{head}:{}", &tail[..8])
        }
        _ => session_key.to_owned(),
    }
}
