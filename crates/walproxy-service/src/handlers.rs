//! The Proxy Frontend and Observability Surface.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use walproxy_ledger::FailureClass;
use walproxy_types::{BackendName, Error, TargetInstance};

use crate::backend_client::PROXIED_BY;
use crate::error_response::error_response;
use crate::state::AppState;

//─────────────────────────────
//  Proxy Frontend
//─────────────────────────────

/// Catch-all handler: every request that doesn't match an observability
/// route lands here and is classified, routed, and forwarded.
pub async fn proxy_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let method_str = method.as_str().to_string();
    let forwarded_headers = relevant_headers(&headers);
    let collection_key = extract_collection_ident(&path).map(str::to_string);

    if matches!(method, Method::GET | Method::HEAD) {
        handle_read(&state, &method_str, &path, collection_key.as_deref(), &body, &forwarded_headers).await
    } else {
        handle_write(&state, &method_str, &path, collection_key, &body, &headers, &forwarded_headers).await
    }
}

async fn handle_read(
    state: &AppState,
    method: &str,
    path: &str,
    collection_key: Option<&str>,
    body: &[u8],
    headers: &[(String, String)],
) -> Response {
    let backend = match state.router.route_read(collection_key) {
        Ok(backend) => backend,
        Err(err) => return simple_error_response(&err),
    };
    let rewritten = match state.mapper.rewrite_path(path, backend).await {
        Ok(rewritten) => rewritten,
        Err(err) => {
            warn!(%err, path, "mapper lookup failed on read, passing through unrewritten");
            path.to_string()
        }
    };
    match state.replayer.send_raw(backend, method, &rewritten, body, headers).await {
        Ok(resp) => build_response(resp.status, resp.body, resp.headers),
        Err(err) => simple_error_response(&err),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_write(
    state: &AppState,
    method: &str,
    path: &str,
    collection_key: Option<String>,
    body: &[u8],
    raw_headers: &HeaderMap,
    headers: &[(String, String)],
) -> Response {
    let data = serde_json::from_slice::<serde_json::Value>(body).ok();
    let client_ip = raw_headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let client_session = raw_headers
        .get("x-client-session")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let operation_type = classify_operation(method, path);

    let txn = match state
        .ledger
        .log_attempting(
            method.to_string(),
            path.to_string(),
            data,
            headers.to_vec(),
            TargetInstance::Both,
            client_session,
            client_ip,
            operation_type,
        )
        .await
    {
        Ok(txn) => txn,
        Err(err) => return simple_error_response(&err),
    };

    let backend = match state.router.route_write() {
        Ok(backend) => backend,
        Err(err) => {
            let _ = state
                .ledger
                .mark_failure(txn.transaction_id, FailureClass::Other, err.to_string())
                .await;
            return error_response(&err, txn.transaction_id);
        }
    };

    let rewritten = if method.eq_ignore_ascii_case("DELETE") {
        path.to_string()
    } else {
        match state.mapper.rewrite_path(path, backend).await {
            Ok(rewritten) => rewritten,
            Err(err) => {
                warn!(%err, path, "mapper lookup failed on write, proceeding unrewritten");
                path.to_string()
            }
        }
    };

    let write_id = Uuid::new_v4().to_string();
    if let Err(err) = state
        .wal
        .append(
            write_id.clone(),
            method.to_string(),
            rewritten.clone(),
            body.to_vec(),
            headers.to_vec(),
            TargetInstance::Both,
            backend,
            collection_key.clone(),
        )
        .await
    {
        // Store failures on the synchronous write path surface as a
        // client 503: the proxy refuses to accept a write it cannot
        // durably log.
        let _ = state
            .ledger
            .mark_failure(txn.transaction_id, FailureClass::Other, err.to_string())
            .await;
        return error_response(&err, txn.transaction_id);
    }

    match state.replayer.send_raw(backend, method, &rewritten, body, headers).await {
        Ok(resp) if (200..300).contains(&resp.status) => {
            let _ = state.wal.mark_synchronous_success(&write_id).await;
            let response_data = serde_json::from_slice(&resp.body).ok();
            let _ = state.ledger.mark_completed(txn.transaction_id, resp.status, response_data.clone()).await;

            if let Some(collection_id) = &collection_key {
                state.router.pin_after_write(collection_id, backend);
            }
            reconcile_mapping(state, backend, method, path, &resp.body).await;

            info!(write_id, %backend, operation = %operation_type_label(method, path), "write executed synchronously");
            build_response(resp.status, resp.body, resp.headers)
        }
        Ok(resp) => {
            let _ = state
                .wal
                .mark_synchronous_failure(&write_id, format!("backend returned status {}", resp.status))
                .await;
            let client_rejection = (400..500).contains(&resp.status);
            let class = if client_rejection { FailureClass::ClientRejected } else { FailureClass::Other };
            let _ = state
                .ledger
                .mark_failure(txn.transaction_id, class, format!("backend returned status {}", resp.status))
                .await;
            if client_rejection {
                // A live backend's legitimate rejection is not an
                // infrastructure failure; pass it straight through.
                build_response(resp.status, resp.body, resp.headers)
            } else {
                error_response(
                    &Error::BackendRejected {
                        status: resp.status,
                        body: String::from_utf8_lossy(&resp.body).chars().take(500).collect(),
                    },
                    txn.transaction_id,
                )
            }
        }
        Err(err) => {
            let _ = state.wal.mark_synchronous_failure(&write_id, err.to_string()).await;
            let class = if state.health.is_healthy(backend) {
                FailureClass::TimingGap
            } else {
                FailureClass::Other
            };
            let _ = state.ledger.mark_failure(txn.transaction_id, class, err.to_string()).await;
            error_response(&err, txn.transaction_id)
        }
    }
}

async fn reconcile_mapping(state: &AppState, backend: BackendName, method: &str, path: &str, response_body: &[u8]) {
    if method.eq_ignore_ascii_case("POST") && path.trim_end_matches('/').ends_with("/collections") {
        if let Some((name, uuid, configuration)) = extract_create_response(response_body) {
            if let Err(err) = state.mapper.observe_create(backend, &name, uuid, configuration).await {
                warn!(%err, name, "collection mapping conflict on auto-map");
            }
        }
        return;
    }
    if method.eq_ignore_ascii_case("DELETE") {
        if let Some(ident) = extract_collection_ident(path) {
            if let Err(err) = state.mapper.take_for_delete(ident).await {
                warn!(%err, ident, "failed to forget collection mapping on delete");
            }
        }
    }
}

fn operation_type_label(method: &str, path: &str) -> String {
    classify_operation(method, path)
}

pub(crate) fn extract_create_response(body: &[u8]) -> Option<(String, Uuid, serde_json::Value)> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let name = value.get("name")?.as_str()?.to_string();
    let id = value.get("id")?.as_str()?;
    let uuid = Uuid::parse_str(id).ok()?;
    let configuration = value.get("configuration_json").cloned().unwrap_or(serde_json::json!({}));
    Some((name, uuid, configuration))
}

fn classify_operation(method: &str, path: &str) -> String {
    let trimmed = path.split('?').next().unwrap_or(path).trim_end_matches('/');
    if method.eq_ignore_ascii_case("POST") && trimmed.ends_with("/collections") {
        return "create_collection".to_string();
    }
    if method.eq_ignore_ascii_case("DELETE") && trimmed.contains("/collections/") {
        return "delete_collection".to_string();
    }
    let last_segment = trimmed.rsplit('/').next().unwrap_or("");
    format!("{}:{}", method.to_lowercase(), last_segment)
}

/// Split a path of the form `…/collections/{ident}…` and return `ident`.
fn extract_collection_ident(path: &str) -> Option<&str> {
    const MARKER: &str = "/collections/";
    let trimmed = path.split('?').next().unwrap_or(path);
    let marker_at = trimmed.find(MARKER)?;
    let ident_start = marker_at + MARKER.len();
    let rest = &trimmed[ident_start..];
    let ident_len = rest.find('/').unwrap_or(rest.len());
    if ident_len == 0 {
        return None;
    }
    Some(&rest[..ident_len])
}

fn relevant_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const KEEP: &[&str] = &["content-type", "authorization", "x-chroma-token"];
    headers
        .iter()
        .filter(|(name, _)| KEEP.iter().any(|k| k.eq_ignore_ascii_case(name.as_str())))
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect()
}

fn build_response(status: u16, body: Vec<u8>, headers: Vec<(String, String)>) -> Response {
    let mut builder = axum::http::Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header("x-proxied-by", PROXIED_BY);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder.body(axum::body::Body::from(body)).expect("valid response")
}

fn simple_error_response(err: &Error) -> Response {
    #[derive(Serialize)]
    struct SimpleError {
        error: String,
    }
    let status = match err {
        Error::NoBackendAvailable | Error::StoreUnavailable(_) | Error::StoreTimeout => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, Json(SimpleError { error: err.kind_name().to_string() })).into_response()
}

//─────────────────────────────
//  Observability Surface
//─────────────────────────────

/// `GET /health` → 200 if at least one backend is healthy, else 503.
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let healthy = !state.health.healthy_backends().is_empty();
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(serde_json::json!({ "healthy": healthy }))).into_response()
}

#[derive(Serialize)]
struct StatusResponse {
    backends: Vec<walproxy_types::Backend>,
    wal_status_counts: Vec<(String, i64)>,
    oldest_pending_wal_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    build: &'static str,
}

/// `GET /status` → backend table, WAL counts, build identity.
pub async fn status_handler(State(state): State<AppState>) -> Response {
    let backends = state.health.snapshot();
    match state.wal.status_summary().await {
        Ok((counts, oldest)) => Json(StatusResponse {
            backends,
            wal_status_counts: counts.into_iter().map(|(s, c)| (s.as_str().to_string(), c)).collect(),
            oldest_pending_wal_timestamp: oldest,
            build: env!("CARGO_PKG_VERSION"),
        })
        .into_response(),
        Err(err) => simple_error_response(&err),
    }
}

/// `GET /wal/status` and `GET /wal/stats` → WAL counts and oldest
/// pending timestamp; both endpoints share the same underlying data.
pub async fn wal_status_handler(State(state): State<AppState>) -> Response {
    match state.wal.status_summary().await {
        Ok((counts, oldest)) => Json(serde_json::json!({
            "counts": counts.into_iter().map(|(s, c)| (s.as_str().to_string(), c)).collect::<std::collections::HashMap<_, _>>(),
            "oldest_pending_timestamp": oldest,
        }))
        .into_response(),
        Err(err) => simple_error_response(&err),
    }
}

/// `GET /transaction/safety/status` → ledger counts, timing-gap count.
pub async fn ledger_status_handler(State(state): State<AppState>) -> Response {
    match state.ledger.status_summary().await {
        Ok((counts, timing_gaps)) => Json(serde_json::json!({
            "counts": counts.into_iter().collect::<std::collections::HashMap<_, _>>(),
            "timing_gap_count": timing_gaps,
        }))
        .into_response(),
        Err(err) => simple_error_response(&err),
    }
}

/// `POST /transaction/safety/recovery/trigger` → run one recovery pass
/// synchronously.
pub async fn recovery_trigger_handler(State(state): State<AppState>) -> Response {
    let replayer = crate::backend_client::LedgerReplayer::new(state.replayer.clone(), state.health.clone());
    match state
        .ledger
        .recover_once(&replayer, chrono::Utc::now(), walproxy_ledger::DEFAULT_RECOVERY_BATCH)
        .await
    {
        Ok(stats) => Json(serde_json::json!({
            "attempted": stats.attempted,
            "recovered": stats.recovered,
            "abandoned": stats.abandoned,
            "still_failed": stats.still_failed,
        }))
        .into_response(),
        Err(err) => simple_error_response(&err),
    }
}

#[derive(Deserialize)]
pub struct CleanupRequest {
    days_old: u32,
}

/// `POST /transaction/safety/cleanup` with `{days_old: N}` → delete
/// terminal rows older than N days from every retained table.
pub async fn cleanup_handler(State(state): State<AppState>, Json(req): Json<CleanupRequest>) -> Response {
    let tables = [("wal", "timestamp"), ("ledger", "created_at")];
    let mut deleted = std::collections::HashMap::new();
    for (table, time_column) in tables {
        match state.store.cleanup(table, req.days_old, time_column).await {
            Ok(count) => {
                deleted.insert(table.to_string(), count);
            }
            Err(err) => return simple_error_response(&err),
        }
    }
    Json(serde_json::json!({ "deleted": deleted })).into_response()
}
