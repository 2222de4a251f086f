//! End-to-end scenarios (spec.md §8) driven against a real `sandbox-worker`
//! binary and an in-process `dispatcher::app` router, matching
//! `examples/cyrup-ai-paraphym/packages/cylo/tests/tests.rs`'s top-level
//! integration-test placement.
//! `nsjail` is not assumed to be present on the test host, so every config
//! here sets `allow_missing_nsjail` and lets `nsjail.rs` fall back to a
//! direct exec of `sandbox-worker` - the RPC/pool/dispatcher behavior under
//! test is identical either way, only the isolation wrapper differs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use sandbox_agent::config::Config;
use sandbox_agent::dispatcher::{self, AppState};
use sandbox_agent::procedure::Procedure;
use sandbox_agent::protocol::{self, ExecuteRequest, ExecuteResponse};
use sandbox_agent::registry::PoolRegistry;

fn test_config(cache_dir: &Path, pool_size: usize) -> Config {
    let mut config = Config::from_env();
    config.cache_dir = cache_dir.to_path_buf();
    config.pool_size = pool_size;
    config.worker_startup_timeout_sec = 10;
    config.max_retries = 2;
    config.allow_missing_nsjail = true;
    config.nsjail_bin = PathBuf::from("sandbox-agent-test-host-has-no-nsjail");
    config
}

fn test_state(cache_dir: &Path, pool_size: usize) -> AppState {
    let config = Arc::new(test_config(cache_dir, pool_size));
    let worker_bin = PathBuf::from(env!("CARGO_BIN_EXE_sandbox-worker"));
    let registry = Arc::new(PoolRegistry::new(config.clone(), worker_bin));
    AppState {
        registry,
        config,
        version_fingerprint: Arc::from(sandbox_agent::version_fingerprint()),
    }
}

fn double_int_request(value: i64, timeout_sec: u64) -> ExecuteRequest {
    ExecuteRequest {
        procedure: protocol::encode_stdio(&Procedure::DoubleInt { value }).unwrap(),
        args: Vec::new(),
        kwargs: Vec::new(),
        dependencies: Vec::new(),
        dep_hash: String::new(),
        timeout_sec,
        memory_mb: 256,
        cpus: 1,
    }
}

async fn execute(state: &AppState, request: ExecuteRequest) -> ExecuteResponse {
    let body = protocol::encode_http(&request).unwrap();
    let http_request = Request::builder()
        .method("POST")
        .uri("/execute")
        .body(Body::from(body))
        .unwrap();
    let response = dispatcher::app(state.clone()).oneshot(http_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    protocol::decode_http(&bytes).unwrap()
}

/// Scenario 1 (spec.md §8): `f(x) = x*2`, args `(21,)` -> `result: 42`.
#[tokio::test]
async fn simple_call_doubles() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), 5);

    let response = execute(&state, double_int_request(21, 30)).await;

    assert!(!response.error);
    let result = response.result.expect("successful call carries a result");
    assert_eq!(i64::from_le_bytes(result.try_into().unwrap()), 42);
}

/// Scenario 2: a burst of concurrent identical calls against a pool smaller
/// than the burst size. All results must be correct and the pool must never
/// exceed its target size.
#[tokio::test]
async fn burst_stays_within_pool_cap() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), 3);

    let calls = (0..12i64).map(|i| {
        let state = state.clone();
        tokio::spawn(async move { execute(&state, double_int_request(i, 30)).await })
    });
    let mut results = Vec::new();
    for call in calls {
        results.push(call.await.unwrap());
    }

    for (i, response) in results.into_iter().enumerate() {
        assert!(!response.error, "call {i} failed: {response:?}");
        let result = response.result.unwrap();
        assert_eq!(i64::from_le_bytes(result.try_into().unwrap()), (i as i64) * 2);
    }

    let fingerprint = sandbox_agent::job::EMPTY_DEPENDENCY_FINGERPRINT;
    let snapshot = state
        .registry
        .snapshot(fingerprint)
        .await
        .expect("pool was created by the calls above");
    assert!(snapshot.live <= 3, "pool exceeded its target size: {snapshot:?}");
}

/// Scenario 3: a procedure that raises must surface as a deterministic,
/// non-retried `UserError` with the original message preserved, and the
/// pool must remain usable for the next call.
#[tokio::test]
async fn procedure_raise_is_not_retried_and_pool_stays_usable() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), 2);

    let raise_request = ExecuteRequest {
        procedure: protocol::encode_stdio(&Procedure::Raise {
            kind: "ValueError".to_string(),
            message: "bad".to_string(),
        })
        .unwrap(),
        args: Vec::new(),
        kwargs: Vec::new(),
        dependencies: Vec::new(),
        dep_hash: String::new(),
        timeout_sec: 30,
        memory_mb: 256,
        cpus: 1,
    };

    let response = execute(&state, raise_request).await;
    assert!(response.error);
    assert_eq!(response.kind.as_deref(), Some("UserError"));
    assert!(response.message.unwrap().contains("bad"));

    // The worker that raised is still Ready (a procedure-level failure is
    // not a worker death), so the next call must succeed without a retry.
    let followup = execute(&state, double_int_request(5, 30)).await;
    assert!(!followup.error);
}

/// Scenario 4: a procedure that outlives `timeout_sec` must fail with
/// `Timeout` within a small epsilon, and the pool must recover (worker
/// replaced) for subsequent calls.
#[tokio::test]
async fn timeout_surfaces_and_pool_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), 2);

    let sleep_request = ExecuteRequest {
        procedure: protocol::encode_stdio(&Procedure::Sleep {
            millis: 5_000,
            value: Vec::new(),
        })
        .unwrap(),
        args: Vec::new(),
        kwargs: Vec::new(),
        dependencies: Vec::new(),
        dep_hash: String::new(),
        timeout_sec: 1,
        memory_mb: 256,
        cpus: 1,
    };

    let started = std::time::Instant::now();
    let response = execute(&state, sleep_request).await;
    assert!(response.error);
    assert_eq!(response.kind.as_deref(), Some("Timeout"));
    assert!(
        started.elapsed() < std::time::Duration::from_secs(5),
        "timeout took far longer than the 1s deadline: {:?}",
        started.elapsed()
    );

    let followup = execute(&state, double_int_request(7, 30)).await;
    assert!(!followup.error);
    let result = followup.result.unwrap();
    assert_eq!(i64::from_le_bytes(result.try_into().unwrap()), 14);
}

/// A malformed envelope must decode-fail as an in-band `BadRequest` with a
/// 200 status, never a transport-level error (spec.md §4.5 step 1).
#[tokio::test]
async fn malformed_envelope_is_bad_request_not_transport_error() {
    let http_request = Request::builder()
        .method("POST")
        .uri("/execute")
        .body(Body::from(vec![0xff, 0x00, 0x01]))
        .unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), 1);

    let response = dispatcher::app(state).oneshot(http_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let decoded: ExecuteResponse = protocol::decode_http(&bytes).unwrap();
    assert!(decoded.error);
    assert_eq!(decoded.kind.as_deref(), Some("BadRequest"));
}

/// Scenario 5: a worker that dies mid-RPC must be retried against a freshly
/// acquired handle (P7), and the pool must converge back to its target size.
/// `Procedure::Crash` exits the worker process before it replies, standing
/// in for an externally injected `kill` of the target worker mid-RPC.
#[tokio::test]
async fn worker_death_mid_rpc_is_retried_on_a_fresh_handle() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), 2);

    let crash_request = ExecuteRequest {
        procedure: protocol::encode_stdio(&Procedure::Crash).unwrap(),
        args: Vec::new(),
        kwargs: Vec::new(),
        dependencies: Vec::new(),
        dep_hash: String::new(),
        timeout_sec: 30,
        memory_mb: 256,
        cpus: 1,
    };

    // The crashed worker's handle is consumed by the failed attempt and
    // retried internally against a different, freshly spawned handle; the
    // dispatcher itself has no further procedure to run after a crash, so
    // this surfaces as an exhausted-retries `WorkerDied` rather than success
    // — what matters for P7 is that the pool recovers and a later call on a
    // non-crashing procedure succeeds without ever hitting `PoolSaturated`.
    let response = execute(&state, crash_request).await;
    assert!(response.error);
    assert_eq!(response.kind.as_deref(), Some("WorkerDied"));

    let followup = execute(&state, double_int_request(9, 30)).await;
    assert!(!followup.error);
    let result = followup.result.unwrap();
    assert_eq!(i64::from_le_bytes(result.try_into().unwrap()), 18);

    let fingerprint = sandbox_agent::job::EMPTY_DEPENDENCY_FINGERPRINT;
    let snapshot = state.registry.snapshot(fingerprint).await.unwrap();
    assert!(snapshot.live <= 2, "pool exceeded its target size after recovery: {snapshot:?}");
}

#[tokio::test]
async fn health_and_version_are_live() {
    let tmp = tempfile::tempdir().unwrap();
    let state = test_state(tmp.path(), 1);

    let health = dispatcher::app(state.clone())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let version = dispatcher::app(state)
        .oneshot(Request::builder().uri("/version").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(version.status(), StatusCode::OK);
    let bytes = version.into_body().collect().await.unwrap().to_bytes();
    let fingerprint = String::from_utf8(bytes.to_vec()).unwrap();
    assert_eq!(fingerprint.len(), 16);
    assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
}
