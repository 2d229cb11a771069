//! Shared helpers for steward-core integration tests: an in-memory session
//! host and message sender, a standard fleet configuration, and polling
//! helpers for worker-driven assertions.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use steward_core::config::{AgentConfig, OrchestratorConfig};
use steward_core::host::{
    HistoryMessage, HostError, MessageSender, SessionHost, SessionPatch, StartSessionSpec,
};

// ---------------------------------------------------------------------------
// Mock session host
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockHost {
    pub started: Mutex<Vec<StartSessionSpec>>,
    pub patches: Mutex<Vec<(String, SessionPatch)>>,
    pub session_messages: Mutex<Vec<(String, String)>>,
    pub registered: Mutex<Vec<(String, String)>>,
    pub histories: Mutex<HashMap<String, Vec<HistoryMessage>>>,
    pub depths: Mutex<HashMap<String, i32>>,
    /// When set, `start_session` fails with a transient error.
    pub fail_start: AtomicBool,
    /// When set, the next model-carrying patch is rejected once.
    pub reject_model_once: AtomicBool,
    run_counter: AtomicU64,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_history(&self, session_key: &str, messages: Vec<(&str, &str)>) {
        let messages = messages
            .into_iter()
            .map(|(role, content)| HistoryMessage {
                role: role.to_owned(),
                content: content.to_owned(),
            })
            .collect();
        self.histories
            .lock()
            .unwrap()
            .insert(session_key.to_owned(), messages);
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn last_started(&self) -> Option<StartSessionSpec> {
        self.started.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SessionHost for MockHost {
    async fn start_session(&self, spec: &StartSessionSpec) -> Result<String, HostError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(HostError::Transient("host unavailable".into()));
        }
        let n = self.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.started.lock().unwrap().push(spec.clone());
        Ok(format!("run-{n}"))
    }

    async fn patch_session(
        &self,
        session_key: &str,
        patch: &SessionPatch,
    ) -> Result<(), HostError> {
        if patch.model.is_some() && self.reject_model_once.swap(false, Ordering::SeqCst) {
            return Err(HostError::ModelRejected("model unavailable".into()));
        }
        self.patches
            .lock()
            .unwrap()
            .push((session_key.to_owned(), patch.clone()));
        Ok(())
    }

    async fn send_to_session(&self, session_key: &str, message: &str) -> Result<(), HostError> {
        self.session_messages
            .lock()
            .unwrap()
            .push((session_key.to_owned(), message.to_owned()));
        Ok(())
    }

    async fn fetch_session_history(
        &self,
        session_key: &str,
    ) -> Result<Vec<HistoryMessage>, HostError> {
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(session_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn register_subagent_run(
        &self,
        run_id: &str,
        requester_session_key: &str,
    ) -> Result<(), HostError> {
        self.registered
            .lock()
            .unwrap()
            .push((run_id.to_owned(), requester_session_key.to_owned()));
        Ok(())
    }

    async fn session_depth(&self, session_key: &str) -> Result<Option<i32>, HostError> {
        Ok(self.depths.lock().unwrap().get(session_key).copied())
    }
}

// ---------------------------------------------------------------------------
// Mock message sender
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub channel: String,
    pub target: String,
    pub content: String,
    pub idempotency_key: String,
}

#[derive(Default)]
pub struct MockSender {
    pub sent: Mutex<Vec<SentMessage>>,
    pub removed_reactions: Mutex<Vec<(String, String, String, Option<String>)>>,
    pub fail_send: AtomicBool,
    message_counter: AtomicU64,
}

impl MockSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_sent(&self) -> Option<SentMessage> {
        self.sent.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MessageSender for MockSender {
    async fn send(
        &self,
        channel: &str,
        target: &str,
        content: &str,
        idempotency_key: &str,
    ) -> Result<String, HostError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(HostError::Transient("channel unavailable".into()));
        }
        let n = self.message_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.sent.lock().unwrap().push(SentMessage {
            channel: channel.to_owned(),
            target: target.to_owned(),
            content: content.to_owned(),
            idempotency_key: idempotency_key.to_owned(),
        });
        Ok(format!("msg-{n}"))
    }

    async fn remove_reaction(
        &self,
        channel: &str,
        message_id: &str,
        emoji: &str,
        user_id: Option<&str>,
    ) -> Result<(), HostError> {
        self.removed_reactions.lock().unwrap().push((
            channel.to_owned(),
            message_id.to_owned(),
            emoji.to_owned(),
            user_id.map(str::to_owned),
        ));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Standard test fleet
// ---------------------------------------------------------------------------

fn agent(id: &str, allow: &[&str]) -> AgentConfig {
    AgentConfig {
        id: id.to_owned(),
        allow_agents: allow.iter().map(|s| s.to_string()).collect(),
        model: None,
        thinking_level: None,
        subagent_model: None,
        subagent_thinking_level: None,
    }
}

/// The standard fleet: `main` (orchestrator + system, wildcard allowlist),
/// `jarvis` (plain worker), `iris` (may dispatch to jarvis), `visitor`
/// (no privileges). Approvals go to channel `C-approvals`; `kevin` is the
/// only authorized approver. Timings are shrunk so worker-driven tests
/// finish quickly.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.agents = vec![
        agent("main", &["*"]),
        agent("jarvis", &[]),
        agent("iris", &["jarvis"]),
        agent("visitor", &["jarvis"]),
    ];
    config.system_agents = vec!["main".to_owned()];
    config.approval.orchestrators = vec!["main".to_owned(), "iris".to_owned()];
    config.approval.authorized_approvers = vec!["kevin".to_owned()];
    config.approval.channel_id = Some("C-approvals".to_owned());
    config.alerts.channel_id = Some("C-alerts".to_owned());
    config.queue.worker_poll_ms = 50;
    config.queue.launch_backoff_base_secs = 0.1;
    config.queue.gate_poll_secs = 0.2;
    config.queue.gate_timeout_secs = 10.0;
    config
}

// ---------------------------------------------------------------------------
// Polling helper
// ---------------------------------------------------------------------------

/// Await a condition with a deadline; panics with the given label on
/// timeout. Worker loops are asynchronous, so assertions on their effects
/// poll rather than sleep a fixed amount.
pub async fn wait_until<F, Fut>(label: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if probe().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {label}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
