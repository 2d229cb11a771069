//! Caller identity and visibility rules.
//!
//! The host authenticates platform users; the core receives an opaque
//! caller id and resolves its privilege level from configuration.

use steward_db::models::JobRecord;

use crate::config::OrchestratorConfig;

/// A resolved caller: the opaque agent id plus its privilege flags.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub agent_id: String,
    /// System agents bypass cross-agent visibility restrictions and may use
    /// elevated features such as system prompt additions.
    pub is_system: bool,
    /// Orchestrators are exempt from approval gating by default.
    pub is_orchestrator: bool,
}

impl CallerIdentity {
    pub fn resolve(config: &OrchestratorConfig, agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            is_system: config.is_system_agent(agent_id),
            is_orchestrator: config.is_orchestrator(agent_id),
        }
    }

    /// Visibility rule for status/list results: a non-system caller sees
    /// only jobs it dispatched or is the target of.
    pub fn can_view(&self, job: &JobRecord) -> bool {
        self.is_system || job.dispatched_by == self.agent_id || job.target == self.agent_id
    }
}
