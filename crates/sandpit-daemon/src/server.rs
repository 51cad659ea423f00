//! HTTP server

use crate::config::IsolationMode;
use crate::error::{Result, ServerError};
use crate::pool::Executor;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use sandpit_core::challenge::{ChallengeCatalog, ChallengeSummary, ValidationReport, Validator};
use sandpit_core::collab::{EntryStore, Forwarder, ProgressStore};
use sandpit_core::engine::{RunJob, Runner};
use sandpit_core::protocol::{
    ExecuteRequest, HealthResponse, StatusResponse, ValidateRequest,
};
use sandpit_core::{ConsoleEntry, ExecutionResult, SandboxConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    executor: Arc<Executor>,
    isolation: IsolationMode,
    sandbox: SandboxConfig,
    catalog: ChallengeCatalog,
    entries: Arc<dyn EntryStore>,
    progress: Arc<dyn ProgressStore>,
    forwarder: Forwarder,
    /// Bounds concurrent runs to the executor's capacity
    permits: Semaphore,
    executions: AtomicU64,
    timeouts: AtomicU64,
}

pub struct AppStateParts {
    pub executor: Executor,
    pub isolation: IsolationMode,
    pub sandbox: SandboxConfig,
    pub catalog: ChallengeCatalog,
    pub entries: Arc<dyn EntryStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub concurrency: usize,
}

impl AppState {
    pub fn new(parts: AppStateParts) -> sandpit_core::Result<Self> {
        let forwarder = Forwarder::spawn(Arc::clone(&parts.entries))?;
        Ok(Self {
            inner: Arc::new(Inner {
                executor: Arc::new(parts.executor),
                isolation: parts.isolation,
                sandbox: parts.sandbox,
                catalog: parts.catalog,
                entries: parts.entries,
                progress: parts.progress,
                forwarder,
                permits: Semaphore::new(parts.concurrency.max(1)),
                executions: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
            }),
        })
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// Run a blocking job on the executor under a concurrency permit
    async fn dispatch<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<Executor>) -> sandpit_core::Result<T> + Send + 'static,
    {
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| ServerError::Internal("executor is shutting down".into()))?;
        let executor = Arc::clone(&self.inner.executor);
        let out = tokio::task::spawn_blocking(move || work(&executor)).await??;
        Ok(out)
    }

    fn count(&self, result: &ExecutionResult) {
        self.inner.executions.fetch_add(1, Ordering::Relaxed);
        if result.timed_out() {
            self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/execute", post(execute))
        .route("/api/challenges", get(list_challenges))
        .route("/api/challenges/{id}/validate", post(validate_challenge))
        .route(
            "/api/contexts/{id}/entries",
            get(context_entries).delete(clear_context_entries),
        )
        .route("/api/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecutionResult>> {
    let timeout = state
        .inner
        .sandbox
        .effective_timeout(req.timeout_ms.map(Duration::from_millis));

    let mut job = RunJob::new(req.source, timeout);
    if let Some(context_id) = req.context_id.as_deref() {
        job = job.with_listener(state.inner.forwarder.listener_for(context_id));
    }

    tracing::debug!(context_id = ?req.context_id, ?timeout, "execute request");
    let result = state.dispatch(move |executor| executor.run(job)).await?;
    state.count(&result);
    Ok(Json(result))
}

async fn list_challenges(State(state): State<AppState>) -> Json<Vec<ChallengeSummary>> {
    Json(state.inner.catalog.list())
}

async fn validate_challenge(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<ValidationReport>> {
    let challenge = state.inner.catalog.get(&id)?.clone();
    let timeout = state.inner.sandbox.challenge_timeout;
    let progress = Arc::clone(&state.inner.progress);

    let report = state
        .dispatch(move |executor| {
            Validator::new(Arc::clone(executor), timeout)
                .with_progress(progress)
                .validate(&challenge, &req.source)
        })
        .await?;
    Ok(Json(report))
}

async fn context_entries(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ConsoleEntry>>> {
    Ok(Json(state.inner.entries.entries(&id)?))
}

async fn clear_context_entries(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.inner.entries.clear_entries(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        isolation: state.inner.isolation.as_str().to_string(),
        pool: state.inner.executor.status(),
        executions: state.inner.executions.load(Ordering::Relaxed),
        timeouts: state.inner.timeouts.load(Ordering::Relaxed),
    })
}
