//! The orchestrator service: owns startup, recovery, the worker fleet, the
//! periodic sweeps, and shutdown.
//!
//! Components are resolved at call time through the service handle rather
//! than captured by the tools and hooks: the service may start after hooks
//! register (or fail to start at all), and the dispatch tool must keep
//! functioning in the degraded direct-fallback mode when the store never
//! came up. Readers always observe either a fully-initialized runtime or
//! none.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use steward_db::config::DbConfig;
use steward_db::models::ApprovalRecord;
use steward_db::pool as db_pool;
use steward_db::queries::jobs as job_db;

use crate::alert::{self, QueueEvent};
use crate::approval::{self, ApprovalDeps, ApprovalReply, reactions::ReactionEvent};
use crate::breaker::CircuitBreaker;
use crate::config::OrchestratorConfig;
use crate::dispatch::{self, DispatchDeps, DispatchParams, DispatchReply, ToolStatus};
use crate::gate::GateWorker;
use crate::hooks::{self, HookDeps, ObservedSpawn};
use crate::host::{MessageSender, SessionHost};
use crate::learning::{self, AddLearningParams, AddLearningReply, LearningsParams, LearningsReply};
use crate::query::{self, ActivityReply, ListParams, ListReply, StatusReply};
use crate::tracker::JobTracker;
use crate::worker::AgentWorker;

/// Error recorded on jobs interrupted by a restart. Their true state is
/// unknowable without a persistent executor, so recovery fails forward.
pub const RESTART_RECOVERY_ERROR: &str = "Gateway restart during execution — job state unknown";

/// How long startup waits for the store before going degraded.
const STORE_READY_TIMEOUT: Duration = Duration::from_secs(10);

struct Runtime {
    pool: PgPool,
    tracker: Arc<JobTracker>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// The service handle. Tools and hooks go through this to reach whatever
/// components currently exist.
pub struct OrchestratorService {
    config: Arc<OrchestratorConfig>,
    host: Arc<dyn SessionHost>,
    sender: Arc<dyn MessageSender>,
    breaker: Arc<CircuitBreaker>,
    events: broadcast::Sender<QueueEvent>,
    runtime: RwLock<Option<Runtime>>,
}

impl OrchestratorService {
    pub fn new(
        config: OrchestratorConfig,
        host: Arc<dyn SessionHost>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        let config = config.validated();
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker.failure_threshold,
            Duration::from_millis(config.breaker.reset_timeout_ms),
        ));
        let (events, _) = broadcast::channel(256);
        Self {
            config: Arc::new(config),
            host,
            sender,
            breaker,
            events,
            runtime: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The current tracker, when the store is up.
    pub fn tracker(&self) -> Option<Arc<JobTracker>> {
        self.read_runtime(|r| Arc::clone(&r.tracker))
    }

    /// The current pool, when the store is up.
    pub fn pool(&self) -> Option<PgPool> {
        self.read_runtime(|r| r.pool.clone())
    }

    fn read_runtime<T>(&self, f: impl FnOnce(&Runtime) -> T) -> Option<T> {
        let guard = self.runtime.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(f)
    }

    /// Connect, recover, and launch the worker fleet.
    ///
    /// Returns `Ok(true)` when fully started, `Ok(false)` when the store
    /// was unreachable within the readiness window: the service stays in
    /// degraded mode and the dispatch tool uses the direct-spawn fallback.
    pub async fn start(&self, db: &DbConfig) -> Result<bool> {
        let connect = async {
            let pool = db_pool::connect(db).await?;
            sqlx::query("SELECT 1")
                .execute(&pool)
                .await
                .context("store readiness probe failed")?;
            Ok::<_, anyhow::Error>(pool)
        };

        let pool = match tokio::time::timeout(STORE_READY_TIMEOUT, connect).await {
            Ok(Ok(pool)) => pool,
            Ok(Err(err)) => {
                if db_pool::is_auth_failure(&err) {
                    self.breaker.force_open("store authentication failure");
                }
                tracing::error!(error = %format!("{err:#}"), "store unavailable, starting degraded");
                return Ok(false);
            }
            Err(_) => {
                tracing::error!(
                    timeout_secs = STORE_READY_TIMEOUT.as_secs(),
                    "store readiness timed out, starting degraded"
                );
                return Ok(false);
            }
        };

        self.recover(&pool).await?;

        let tracker = Arc::new(JobTracker::new(pool.clone(), Arc::clone(&self.config)));
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // One worker loop per configured agent queue.
        for agent in &self.config.agents {
            let worker = AgentWorker {
                agent_id: agent.id.clone(),
                pool: pool.clone(),
                config: Arc::clone(&self.config),
                host: Arc::clone(&self.host),
                events: self.events.clone(),
                cancel: cancel.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        // The dependency-gate worker.
        let gate_worker = GateWorker {
            pool: pool.clone(),
            config: Arc::clone(&self.config),
            cancel: cancel.clone(),
        };
        tasks.push(tokio::spawn(gate_worker.run()));

        // DLQ alerting over the queue-event channel.
        tasks.push(tokio::spawn(alert::run_alerter(
            Arc::clone(&self.config),
            Arc::clone(&self.sender),
            self.events.subscribe(),
            cancel.clone(),
        )));

        // Periodic stale-entry cleanup (non-blocking, failures swallowed).
        tasks.push(tokio::spawn(cleanup_loop(
            Arc::clone(&tracker),
            self.config.queue.cleanup_interval_secs,
            cancel.clone(),
        )));

        // Periodic stall flagging.
        tasks.push(tokio::spawn(stall_sweep_loop(
            pool.clone(),
            self.config.queue.stall_check_secs,
            cancel.clone(),
        )));

        // Store keep-alive.
        tasks.push(tokio::spawn(keepalive_loop(
            pool.clone(),
            Arc::clone(&self.breaker),
            cancel.clone(),
        )));

        let mut guard = self.runtime.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Runtime {
            pool,
            tracker,
            cancel,
            tasks,
        });
        drop(guard);

        tracing::info!(
            agents = self.config.agents.len(),
            "orchestrator service started"
        );
        Ok(true)
    }

    /// One-shot restart recovery.
    ///
    /// Jobs whose record says the child was running are force-failed
    /// (fail-forward; the agent-level retry path covers re-dispatch), and
    /// launches interrupted mid-claim are released back to queued.
    async fn recover(&self, pool: &PgPool) -> Result<()> {
        let released = job_db::release_interrupted_launches(pool).await?;
        if released > 0 {
            tracing::info!(released, "released interrupted launches back to queued");
        }

        let failed = job_db::recover_interrupted_jobs(pool, RESTART_RECOVERY_ERROR).await?;
        for job in &failed {
            tracing::warn!(
                job_id = %job.id,
                target = %job.target,
                "marked interrupted job failed during recovery"
            );
        }
        Ok(())
    }

    /// Stop everything: workers first (they hold the launch locks), then
    /// the event consumers and sweeps, then the store connection.
    pub async fn stop(&self) {
        let runtime = {
            let mut guard = self.runtime.write().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        let Some(runtime) = runtime else {
            return;
        };

        runtime.cancel.cancel();
        for result in futures::future::join_all(runtime.tasks).await {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    tracing::warn!(error = %err, "worker task ended abnormally");
                }
            }
        }
        runtime.pool.close().await;
        tracing::info!("orchestrator service stopped");
    }

    // -----------------------------------------------------------------------
    // Dispatcher-facing tools (components resolved per call)
    // -----------------------------------------------------------------------

    pub async fn dispatch(&self, caller: &str, params: DispatchParams) -> DispatchReply {
        let tracker = self.tracker();
        let deps = DispatchDeps {
            config: &self.config,
            host: self.host.as_ref(),
            sender: self.sender.as_ref(),
            breaker: &self.breaker,
            tracker: tracker.as_deref(),
        };
        dispatch::dispatch(&deps, caller, params).await
    }

    pub async fn status(&self, caller: &str, job_id: &str) -> StatusReply {
        match self.pool() {
            Some(pool) => query::status(&pool, &self.config, caller, job_id).await,
            None => StatusReply {
                status: ToolStatus::Error,
                job: None,
                error: Some("job store unavailable".to_owned()),
            },
        }
    }

    pub async fn list(&self, caller: &str, params: ListParams) -> ListReply {
        match self.pool() {
            Some(pool) => query::list(&pool, &self.config, caller, params).await,
            None => ListReply {
                status: ToolStatus::Error,
                jobs: Vec::new(),
                count: 0,
                limit: params.limit.unwrap_or(20),
                error: Some("job store unavailable".to_owned()),
            },
        }
    }

    pub async fn activity(&self) -> ActivityReply {
        match self.pool() {
            Some(pool) => query::activity(&pool, &self.config).await,
            None => ActivityReply {
                status: ToolStatus::Error,
                agents: Default::default(),
                summary: String::new(),
                error: Some("job store unavailable".to_owned()),
            },
        }
    }

    pub async fn add_learning(&self, caller: &str, params: AddLearningParams) -> AddLearningReply {
        match self.pool() {
            Some(pool) => learning::add_learning(&pool, &self.config, caller, params).await,
            None => AddLearningReply {
                status: ToolStatus::Error,
                id: None,
                project_id: None,
                job_id: None,
                tags: None,
                error: Some("job store unavailable".to_owned()),
            },
        }
    }

    pub async fn learnings(&self, params: LearningsParams) -> LearningsReply {
        match self.pool() {
            Some(pool) => learning::learnings(&pool, params).await,
            None => LearningsReply {
                status: ToolStatus::Error,
                entries: Vec::new(),
                error: Some("job store unavailable".to_owned()),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Approval surface
    // -----------------------------------------------------------------------

    pub async fn approve(&self, input: &str, approver: &str) -> ApprovalReply {
        match self.pool() {
            Some(pool) => {
                let deps = self.approval_deps(&pool);
                approval::approve(&deps, input, approver).await
            }
            None => ApprovalReply {
                status: ToolStatus::Error,
                id: None,
                message: "job store unavailable".to_owned(),
            },
        }
    }

    pub async fn reject(&self, input: &str, rejecter: &str) -> ApprovalReply {
        match self.pool() {
            Some(pool) => {
                let deps = self.approval_deps(&pool);
                approval::reject(&deps, input, rejecter).await
            }
            None => ApprovalReply {
                status: ToolStatus::Error,
                id: None,
                message: "job store unavailable".to_owned(),
            },
        }
    }

    /// `/pending` is gated like approve/reject: only authorized approvers
    /// may see the queue.
    pub async fn pending(&self, actor: &str, limit: i64) -> Result<Vec<ApprovalRecord>> {
        if !self
            .config
            .approval
            .authorized_approvers
            .iter()
            .any(|a| a == actor)
        {
            anyhow::bail!("{actor} is not an authorized approver");
        }
        match self.pool() {
            Some(pool) => {
                let deps = self.approval_deps(&pool);
                approval::pending(&deps, limit).await
            }
            None => anyhow::bail!("job store unavailable"),
        }
    }

    pub async fn on_reaction(&self, event: ReactionEvent) {
        if let Some(pool) = self.pool() {
            let deps = self.approval_deps(&pool);
            approval::reactions::on_reaction(&deps, event).await;
        }
    }

    fn approval_deps<'a>(&'a self, pool: &'a PgPool) -> ApprovalDeps<'a> {
        ApprovalDeps {
            config: &self.config,
            host: self.host.as_ref(),
            sender: self.sender.as_ref(),
            pool,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle hooks
    // -----------------------------------------------------------------------

    pub async fn on_spawn_observed(&self, spawn: ObservedSpawn) {
        let tracker = self.tracker();
        let deps = HookDeps {
            config: &self.config,
            host: self.host.as_ref(),
            sender: self.sender.as_ref(),
            tracker: tracker.as_deref(),
            events: Some(&self.events),
        };
        hooks::on_spawn_observed(&deps, spawn).await;
    }

    pub async fn on_agent_end(&self, session_key: &str, success: bool, error: Option<&str>) {
        let tracker = self.tracker();
        let deps = HookDeps {
            config: &self.config,
            host: self.host.as_ref(),
            sender: self.sender.as_ref(),
            tracker: tracker.as_deref(),
            events: Some(&self.events),
        };
        hooks::on_agent_end(&deps, session_key, success, error).await;
    }
}

/// Hourly (by default) stale-entry cleanup. Never blocks the queues;
/// failures are logged and swallowed.
async fn cleanup_loop(tracker: Arc<JobTracker>, interval_secs: u64, cancel: CancellationToken) {
    let interval = Duration::from_secs(interval_secs.max(60));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
        match tracker.cleanup_stale_entries().await {
            Ok(report) => {
                tracing::info!(
                    jobs = report.jobs_pruned,
                    gates = report.gates_pruned,
                    approvals = report.approvals_expired,
                    learnings = report.learnings_expired,
                    "stale-entry cleanup done"
                );
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "stale-entry cleanup failed");
            }
        }
    }
}

/// Periodic store keep-alive: detects connection loss early and trips the
/// breaker on authentication failures. Reconnection itself is the pool's
/// job; this loop backs off exponentially (capped at 30 s) while the store
/// is down so the probe does not flood a struggling server.
async fn keepalive_loop(pool: PgPool, breaker: Arc<CircuitBreaker>, cancel: CancellationToken) {
    let base = Duration::from_secs(15);
    let cap = Duration::from_secs(30);
    let mut delay = base;
    let mut healthy = true;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
        match sqlx::query("SELECT 1").execute(&pool).await {
            Ok(_) => {
                if !healthy {
                    tracing::info!("store connection recovered");
                }
                healthy = true;
                delay = base;
            }
            Err(err) => {
                let err = anyhow::Error::new(err);
                if db_pool::is_auth_failure(&err) {
                    breaker.force_open("store authentication failure");
                }
                if healthy {
                    tracing::warn!(error = %format!("{err:#}"), "store keep-alive failed");
                }
                healthy = false;
                delay = (delay * 2).min(cap);
            }
        }
    }
}

/// Flag expired launch locks so stalls are visible between reclaims.
async fn stall_sweep_loop(pool: PgPool, interval_secs: u64, cancel: CancellationToken) {
    let interval = Duration::from_secs(interval_secs.max(10));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
        match job_db::sweep_stalled(&pool).await {
            Ok(0) => {}
            Ok(flagged) => tracing::warn!(flagged, "flagged stalled launches"),
            Err(err) => tracing::warn!(error = %err, "stall sweep failed"),
        }
    }
}
