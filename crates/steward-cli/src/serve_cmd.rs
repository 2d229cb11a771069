//! `steward serve`: the read-only monitoring endpoint.
//!
//! Gated by a bearer token from `monitor.auth_token`; an empty token
//! disables the endpoint entirely (fail-secure), so there is no
//! unauthenticated mode to misconfigure.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use steward_core::config::OrchestratorConfig;
use steward_core::tracker::JobTracker;
use steward_db::queries::{approvals as approval_db, jobs as job_db};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid bearer token".to_owned(),
        }
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State & auth
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    config: Arc<OrchestratorConfig>,
    token: String,
}

fn require_bearer(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == state.token => Ok(()),
        _ => Err(AppError::unauthorized()),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

fn build_router(pool: PgPool, config: Arc<OrchestratorConfig>, token: String) -> Router {
    let state = AppState {
        pool,
        config,
        token,
    };
    Router::new()
        .route("/api/queues", get(list_queues))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/approvals/pending", get(list_pending))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    pool: PgPool,
    config: &OrchestratorConfig,
    bind: &str,
    port: u16,
) -> Result<()> {
    let token = config.monitor.auth_token.clone();
    if token.is_empty() {
        anyhow::bail!("monitor.auth_token is empty, the monitoring endpoint is disabled");
    }

    let app = build_router(pool, Arc::new(config.clone()), token);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("steward serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("steward serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_queues(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::response::Response, AppError> {
    require_bearer(&state, &headers)?;

    let tracker = JobTracker::new(state.pool.clone(), Arc::clone(&state.config));
    let stats = tracker.queue_stats(None).await.map_err(AppError::internal)?;

    let body: Vec<serde_json::Value> = stats
        .into_iter()
        .map(|(queue, s)| {
            serde_json::json!({
                "queue": queue,
                "waiting": s.waiting,
                "delayed": s.delayed,
                "waiting_deps": s.waiting_deps,
                "active": s.active,
                "completed": s.completed,
                "failed": s.failed,
            })
        })
        .collect();

    Ok(Json(body).into_response())
}

async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    require_bearer(&state, &headers)?;

    let job = job_db::get_job(&state.pool, &id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("job {id} not found")))?;

    Ok(Json(job).into_response())
}

async fn list_pending(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<axum::response::Response, AppError> {
    require_bearer(&state, &headers)?;

    let pending = approval_db::list_pending(&state.pool, 100)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(pending).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
