//! End-to-end scenarios driven through the same `axum::Router` the
//! binary serves, against `SqliteStore` and two local mock backends
//! standing in for the primary/replica databases.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, State as AxumState};
use axum::routing::{delete, get, post};
use axum::{Json, Router as AxumRouter};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower::ServiceExt;
use uuid::Uuid;

use walproxy_health::HealthProber;
use walproxy_ledger::SafetyLedger;
use walproxy_mapper::CollectionMapper;
use walproxy_router::Router as WalRouter;
use walproxy_store::{SqliteStore, StoreAdapter};
use walproxy_types::Backend;
use walproxy_wal::WalEngine;

use walproxy_service::backend_client::HttpReplayer;
use walproxy_service::config::Config;
use walproxy_service::{create_app, AppState};

/// A trivial in-memory stand-in for a Chroma-like backend: tracks
/// collections by name, mints a UUID on create, accepts deletes.
#[derive(Default)]
struct MockBackend {
    collections: Mutex<HashMap<String, Uuid>>,
}

async fn mock_version() -> Json<Value> {
    Json(json!({ "version": "0.1.0" }))
}

async fn mock_create(
    AxumState(backend): AxumState<Arc<MockBackend>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let name = body.get("name").and_then(Value::as_str).unwrap_or("unnamed").to_string();
    let id = Uuid::new_v4();
    backend.collections.lock().await.insert(name.clone(), id);
    Json(json!({ "name": name, "id": id.to_string(), "configuration_json": {} }))
}

async fn mock_delete(
    AxumState(backend): AxumState<Arc<MockBackend>>,
    AxumPath(ident): AxumPath<String>,
) -> axum::http::StatusCode {
    let mut collections = backend.collections.lock().await;
    let name = collections
        .iter()
        .find(|(_, id)| id.to_string() == ident)
        .map(|(name, _)| name.clone())
        .unwrap_or(ident);
    collections.remove(&name);
    axum::http::StatusCode::OK
}

async fn mock_get(AxumState(_backend): AxumState<Arc<MockBackend>>) -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// Spin up a mock backend on an ephemeral localhost port, returning its
/// base URL. The server runs for the lifetime of the test process.
async fn spawn_mock_backend() -> String {
    let backend = Arc::new(MockBackend::default());
    let app = AxumRouter::new()
        .route("/api/v2/version", get(mock_version))
        .route("/api/v2/collections", post(mock_create))
        .route("/api/v2/collections/{ident}", delete(mock_delete))
        .route("/api/v2/collections/{ident}", get(mock_get))
        .with_state(backend);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock backend");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock backend serve");
    });
    format!("http://{addr}")
}

fn test_config(primary_url: String, replica_url: String) -> Config {
    Config {
        primary_url,
        replica_url,
        database_url: "sqlite::memory:".to_string(),
        port: 0,
        log_level: "info".to_string(),
        check_interval: Duration::from_secs(30),
        failure_threshold: 3,
        wal_sync_interval: Duration::from_secs(10),
        wal_batch_size: 50,
        wal_high_volume_batch_size: 200,
        wal_memory_threshold: 80,
        wal_cpu_threshold: 80,
        wal_retry_attempts: 3,
        wal_retry_delay: Duration::from_secs(5),
        wal_deletion_conversion: true,
        read_replica_ratio: 0.8,
        consistency_window: Duration::from_secs(30),
        request_timeout: Duration::from_secs(5),
        max_workers: 3,
        max_memory_mb: 450,
        wal_retention_days: 7,
        ledger_retention_days: 7,
        health_metrics_retention_days: 7,
    }
}

/// Build a full `AppState` wired against two live mock backends and an
/// in-memory `SqliteStore`, mirroring `main.rs`'s wiring.
async fn build_state(primary_url: String, replica_url: String) -> AppState {
    let config = Arc::new(test_config(primary_url.clone(), replica_url.clone()));
    let store: Arc<dyn StoreAdapter> = Arc::new(SqliteStore::in_memory().await.expect("in-memory store"));

    let health = Arc::new(HealthProber::new(
        vec![
            Backend::new(walproxy_types::BackendName::Primary, primary_url, 0),
            Backend::new(walproxy_types::BackendName::Replica, replica_url, 1),
        ],
        config.failure_threshold,
    ));

    let mapper: Arc<CollectionMapper<dyn StoreAdapter>> = Arc::new(CollectionMapper::new(store.clone()));
    let ledger: Arc<SafetyLedger<dyn StoreAdapter>> = Arc::new(SafetyLedger::new(store.clone()));
    let wal: Arc<WalEngine<dyn StoreAdapter>> = Arc::new(WalEngine::new(store.clone()));
    let router = Arc::new(WalRouter::new(health.clone(), config.read_replica_ratio, config.consistency_window));
    let replayer = Arc::new(HttpReplayer::new(&config, mapper.clone()).expect("replayer"));

    AppState {
        config,
        store,
        mapper,
        ledger,
        wal,
        health,
        router,
        replayer,
    }
}

fn request(method: &str, path: &str, body: Value) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .expect("valid request")
}

#[tokio::test]
async fn healthy_steady_state_creates_and_syncs_mapping() {
    let primary_url = spawn_mock_backend().await;
    let replica_url = spawn_mock_backend().await;
    let state = build_state(primary_url, replica_url).await;
    state.health.probe_once().await;

    let app = create_app(state.clone());
    let response = app
        .oneshot(request("POST", "/api/v2/collections", json!({ "name": "docs_A" })))
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let mapping = state.mapper.get("docs_A").await.expect("mapping lookup").expect("mapping exists");
    assert!(mapping.primary_uuid.is_some(), "write landed synchronously on primary");
    assert!(mapping.replica_uuid.is_none(), "replica hasn't synced yet");

    let synced = state
        .wal
        .sync_once(walproxy_types::BackendName::Replica, state.replayer.as_ref(), 50)
        .await
        .expect("sync pass succeeds");
    assert_eq!(synced.claimed, 1);
    assert_eq!(synced.synced, 1);

    let mapping = state.mapper.get("docs_A").await.expect("mapping lookup").expect("mapping exists");
    assert!(mapping.is_complete(), "both backends now hold the collection");

    // Replaying the already-synced row is a no-op: nothing left to claim.
    let replay_again = state
        .wal
        .sync_once(walproxy_types::BackendName::Replica, state.replayer.as_ref(), 50)
        .await
        .expect("sync pass succeeds");
    assert_eq!(replay_again.claimed, 0);
}

#[tokio::test]
async fn primary_down_serves_write_from_replica() {
    // Primary URL points nowhere: every dial fails, mirroring a suspended backend.
    let dead_primary = "http://127.0.0.1:1".to_string();
    let replica_url = spawn_mock_backend().await;
    let state = build_state(dead_primary, replica_url).await;
    for _ in 0..state.config.failure_threshold {
        state.health.probe_once().await;
    }
    assert!(!state.health.is_healthy(walproxy_types::BackendName::Primary));

    let app = create_app(state.clone());
    let response = app
        .oneshot(request("POST", "/api/v2/collections", json!({ "name": "docs_B" })))
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    let mapping = state.mapper.get("docs_B").await.expect("mapping lookup").expect("mapping exists");
    assert!(mapping.primary_uuid.is_none());
    assert!(mapping.replica_uuid.is_some());
}

#[tokio::test]
async fn timing_gap_write_marks_ledger_failure_as_timing_gap() {
    // Primary is actually down but the prober hasn't run yet, so the
    // router's cached verdict still says healthy — the timing-gap window.
    let dead_primary = "http://127.0.0.1:1".to_string();
    let replica_url = spawn_mock_backend().await;
    let state = build_state(dead_primary, replica_url).await;
    assert!(state.health.is_healthy(walproxy_types::BackendName::Primary));

    let app = create_app(state.clone());
    let response = app
        .oneshot(request("POST", "/api/v2/collections", json!({ "name": "docs_C" })))
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);

    let (counts, timing_gaps) = state.ledger.status_summary().await.expect("ledger status");
    let failed = counts.iter().find(|(status, _)| status == "FAILED").map(|(_, c)| *c).unwrap_or(0);
    assert_eq!(failed, 1);
    assert_eq!(timing_gaps, 1, "failure is classified as a timing-gap, not an ordinary backend-down failure");
}

#[tokio::test]
async fn all_backends_unhealthy_returns_503_with_no_wal_row() {
    let dead_primary = "http://127.0.0.1:1".to_string();
    let dead_replica = "http://127.0.0.1:2".to_string();
    let state = build_state(dead_primary, dead_replica).await;
    for _ in 0..state.config.failure_threshold {
        state.health.probe_once().await;
    }

    let app = create_app(state.clone());
    let response = app
        .oneshot(request("POST", "/api/v2/collections", json!({ "name": "docs_D" })))
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);

    let (counts, _) = state.wal.status_summary().await.expect("wal status");
    assert!(counts.iter().all(|(_, count)| *count == 0), "no WAL row created when no backend is available");
}

#[tokio::test]
async fn delete_bypasses_rewrite_and_forgets_mapping() {
    let primary_url = spawn_mock_backend().await;
    let replica_url = spawn_mock_backend().await;
    let state = build_state(primary_url, replica_url).await;
    state.health.probe_once().await;
    let app = create_app(state.clone());

    app.clone()
        .oneshot(request("POST", "/api/v2/collections", json!({ "name": "docs_E" })))
        .await
        .expect("create succeeds");
    let mapping = state.mapper.get("docs_E").await.expect("lookup").expect("mapping exists");
    assert!(mapping.primary_uuid.is_some());

    let response = app
        .oneshot(request("DELETE", "/api/v2/collections/docs_E", Value::Null))
        .await
        .expect("delete succeeds");
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    assert!(state.mapper.get("docs_E").await.expect("lookup").is_none(), "mapping forgotten after delete");
}

#[tokio::test]
async fn consistency_window_pins_reads_to_the_write_backend() {
    let primary_url = spawn_mock_backend().await;
    let replica_url = spawn_mock_backend().await;
    let state = build_state(primary_url, replica_url).await;
    state.health.probe_once().await;
    let app = create_app(state.clone());

    app.clone()
        .oneshot(request("POST", "/api/v2/collections", json!({ "name": "docs_F" })))
        .await
        .expect("create succeeds");

    for _ in 0..10 {
        assert_eq!(
            state.router.route_read(Some("docs_F")).expect("route"),
            walproxy_types::BackendName::Primary,
            "every read within the consistency window sticks to the backend that served the write"
        );
    }
}

#[tokio::test]
async fn wal_permanent_failure_stops_after_max_retries() {
    let primary_url = spawn_mock_backend().await;
    // Replica always rejects every request with 400, simulating a
    // malformed write neither backend will ever accept.
    let rejecting_app = AxumRouter::new().fallback(|| async { axum::http::StatusCode::BAD_REQUEST });
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, rejecting_app).await.expect("serve");
    });
    let replica_url = format!("http://{addr}");

    let state = build_state(primary_url, replica_url).await;
    state.health.probe_once().await;

    let write_id = "wal-permanent-failure-test".to_string();
    state
        .wal
        .append(
            write_id.clone(),
            "POST".to_string(),
            "/api/v2/collections/malformed/upsert".to_string(),
            b"{}".to_vec(),
            vec![],
            walproxy_types::TargetInstance::Both,
            walproxy_types::BackendName::Primary,
            Some("malformed".to_string()),
        )
        .await
        .expect("append");
    state.wal.mark_synchronous_success(&write_id).await.expect("mark executed");

    let mut last_stats = None;
    for _ in 0..walproxy_wal::WAL_MAX_RETRIES {
        last_stats = Some(
            state
                .wal
                .sync_once(walproxy_types::BackendName::Replica, state.replayer.as_ref(), 50)
                .await
                .expect("sync pass"),
        );
    }
    let last_stats = last_stats.expect("ran at least one pass");
    assert_eq!(last_stats.failed, 1, "row exceeds retry ceiling and is marked failed");

    // No further replay attempts on an already-failed row.
    let after_failure = state
        .wal
        .sync_once(walproxy_types::BackendName::Replica, state.replayer.as_ref(), 50)
        .await
        .expect("sync pass");
    assert_eq!(after_failure.claimed, 0);

    let (counts, _) = state.wal.status_summary().await.expect("wal status");
    let failed_count = counts
        .iter()
        .find(|(status, _)| *status == walproxy_types::WalStatus::Failed)
        .map(|(_, count)| *count)
        .unwrap_or(0);
    assert_eq!(failed_count, 1);
}

#[tokio::test]
async fn health_and_observability_endpoints_respond() {
    let primary_url = spawn_mock_backend().await;
    let replica_url = spawn_mock_backend().await;
    let state = build_state(primary_url, replica_url).await;
    state.health.probe_once().await;
    let app = create_app(state);

    let health = app.clone().oneshot(request("GET", "/health", Value::Null)).await.expect("health ok");
    assert_eq!(health.status(), axum::http::StatusCode::OK);

    let status = app.clone().oneshot(request("GET", "/status", Value::Null)).await.expect("status ok");
    assert_eq!(status.status(), axum::http::StatusCode::OK);

    let wal_status = app
        .clone()
        .oneshot(request("GET", "/wal/status", Value::Null))
        .await
        .expect("wal status ok");
    assert_eq!(wal_status.status(), axum::http::StatusCode::OK);

    let ledger_status = app
        .oneshot(request("GET", "/transaction/safety/status", Value::Null))
        .await
        .expect("ledger status ok");
    assert_eq!(ledger_status.status(), axum::http::StatusCode::OK);
}
