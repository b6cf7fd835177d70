//! The concrete HTTP client that actually dials the two backends.
//!
//! This is the single place that owns a `reqwest::Client`: it backs the
//! Proxy Frontend's synchronous forwarding, the WAL engine's
//! [`BackendReplayer`] replay path, and the ledger's [`Replayer`]
//! recovery replay path, so all three share the same connection pool,
//! timeout, and collection-identity rewrite logic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use walproxy_ledger::{RecoveryOutcome, Replayer};
use walproxy_mapper::CollectionMapper;
use walproxy_store::StoreAdapter;
use walproxy_types::{BackendName, Error, LedgerTransaction, Result, TargetInstance};
use walproxy_wal::{BackendReplayer, SyncOutcome};

use crate::config::Config;

/// Headers that must never be forwarded verbatim between hops (RFC 7230
/// §6.1 plus `host`, which must be recomputed for the target backend).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// The name the proxy identifies itself with in `X-Proxied-By`.
pub const PROXIED_BY: &str = "walproxy";

/// A raw backend response, stripped of hop-by-hop headers.
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body bytes.
    pub body: Vec<u8>,
    /// Response headers, hop-by-hop entries already removed.
    pub headers: Vec<(String, String)>,
}

/// Dials the two backends directly, rewriting collection identity
/// through the mapper before every call except `DELETE`, which bypasses
/// the rewrite indirection entirely.
pub struct HttpReplayer {
    client: reqwest::Client,
    mapper: Arc<CollectionMapper<dyn StoreAdapter>>,
    base_urls: HashMap<BackendName, String>,
    primary_inflight: Semaphore,
    replica_inflight: Semaphore,
}

impl HttpReplayer {
    /// Build a replayer from configuration.
    pub fn new(config: &Config, mapper: Arc<CollectionMapper<dyn StoreAdapter>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(Error::from_backend)?;

        let mut base_urls = HashMap::new();
        base_urls.insert(BackendName::Primary, config.primary_url.trim_end_matches('/').to_string());
        base_urls.insert(BackendName::Replica, config.replica_url.trim_end_matches('/').to_string());

        Ok(Self {
            client,
            mapper,
            base_urls,
            primary_inflight: Semaphore::new(config.max_workers.max(1)),
            replica_inflight: Semaphore::new(config.max_workers.max(1)),
        })
    }

    fn inflight(&self, backend: BackendName) -> &Semaphore {
        match backend {
            BackendName::Primary => &self.primary_inflight,
            BackendName::Replica => &self.replica_inflight,
        }
    }

    /// Dispatch a request to `backend` at the already-resolved `path`.
    /// Unbounded: this is the dial path the synchronous Proxy Frontend
    /// calls directly, and live client traffic is never gated by the
    /// per-backend in-flight semaphore. Background replay goes through
    /// [`Self::send_raw_throttled`] instead.
    pub async fn send_raw(
        &self,
        backend: BackendName,
        method: &str,
        path: &str,
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<RawResponse> {
        let base_url = self
            .base_urls
            .get(&backend)
            .ok_or_else(|| Error::Config(format!("no base URL configured for {backend}")))?;
        let url = format!("{base_url}{path}");
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::Config(format!("invalid HTTP method: {method}")))?;

        let mut request = self.client.request(method, &url).body(body.to_vec());
        for (name, value) in headers {
            if HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name)) {
                continue;
            }
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(Error::from_backend)?;
        let status = response.status().as_u16();
        let response_headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name.as_str())))
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response.bytes().await.map_err(Error::from_backend)?.to_vec();

        Ok(RawResponse {
            status,
            body,
            headers: response_headers,
        })
    }

    /// Like [`Self::send_raw`], bounded by the per-backend in-flight
    /// semaphore capping maximum concurrent in-flight sync requests per
    /// backend. Used by WAL sync and ledger recovery replay only.
    async fn send_raw_throttled(
        &self,
        backend: BackendName,
        method: &str,
        path: &str,
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<RawResponse> {
        let _permit = self.inflight(backend).acquire().await.expect("semaphore never closed");
        self.send_raw(backend, method, path, body, headers).await
    }

    /// Resolve `path` for `backend` the way every replay path does:
    /// unrewritten for `DELETE` (collection deletes are routed to the
    /// original path on both backends), mapper-rewritten otherwise.
    async fn resolve_path(&self, method: &str, path: &str, backend: BackendName) -> Result<String> {
        if method.eq_ignore_ascii_case("DELETE") {
            Ok(path.to_string())
        } else {
            self.mapper.rewrite_path(path, backend).await
        }
    }

    /// Pick a backend to replay a ledger transaction against: primary if
    /// its target includes it and it's healthy, else replica.
    fn choose_backend(&self, target: TargetInstance, healthy: impl Fn(BackendName) -> bool) -> Option<BackendName> {
        if target.includes(BackendName::Primary) && healthy(BackendName::Primary) {
            Some(BackendName::Primary)
        } else if target.includes(BackendName::Replica) && healthy(BackendName::Replica) {
            Some(BackendName::Replica)
        } else {
            None
        }
    }
}

#[async_trait]
impl BackendReplayer for HttpReplayer {
    async fn replay(
        &self,
        backend: BackendName,
        method: &str,
        path: &str,
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<SyncOutcome> {
        let resolved = self.resolve_path(method, path, backend).await?;
        let response = self.send_raw_throttled(backend, method, &resolved, body, headers).await?;

        // Replaying a collection create against the lagging backend mints a
        // second, backend-local UUID that must join the same mapping row
        // the synchronous path already created. Auto-mapping applies
        // identically on replay, not only on the first attempt.
        if (200..300).contains(&response.status)
            && method.eq_ignore_ascii_case("POST")
            && path.trim_end_matches('/').ends_with("/collections")
        {
            if let Some((name, uuid, configuration)) = crate::handlers::extract_create_response(&response.body) {
                if let Err(err) = self.mapper.observe_create(backend, &name, uuid, configuration).await {
                    tracing::warn!(%err, name, "collection mapping conflict on replay auto-map");
                }
            }
        }

        Ok(SyncOutcome { status: response.status })
    }
}

/// Adapts [`HttpReplayer`] to the ledger's [`Replayer`] trait; the
/// health snapshot it consults is passed in at construction since the
/// ledger crate must stay ignorant of the health prober.
pub struct LedgerReplayer {
    inner: Arc<HttpReplayer>,
    health: Arc<walproxy_health::HealthProber>,
}

impl LedgerReplayer {
    /// Wrap an `HttpReplayer` with the health prober it should consult.
    pub fn new(inner: Arc<HttpReplayer>, health: Arc<walproxy_health::HealthProber>) -> Self {
        Self { inner, health }
    }
}

#[async_trait]
impl Replayer for LedgerReplayer {
    async fn any_backend_healthy(&self, target: TargetInstance) -> bool {
        (target.includes(BackendName::Primary) && self.health.is_healthy(BackendName::Primary))
            || (target.includes(BackendName::Replica) && self.health.is_healthy(BackendName::Replica))
    }

    async fn replay(&self, txn: &LedgerTransaction) -> Result<RecoveryOutcome> {
        let backend = self
            .inner
            .choose_backend(txn.target_instance, |b| self.health.is_healthy(b))
            .ok_or(Error::NoBackendAvailable)?;

        let body = match &txn.data {
            Some(value) => serde_json::to_vec(value).unwrap_or_default(),
            None => Vec::new(),
        };
        let resolved = self.inner.resolve_path(&txn.method, &txn.path, backend).await?;
        let response = self
            .inner
            .send_raw_throttled(backend, &txn.method, &resolved, &body, &txn.headers)
            .await?;

        if (200..300).contains(&response.status) || response.status == 404 {
            if (200..300).contains(&response.status)
                && txn.method.eq_ignore_ascii_case("POST")
                && txn.path.trim_end_matches('/').ends_with("/collections")
            {
                if let Some((name, uuid, configuration)) = crate::handlers::extract_create_response(&response.body) {
                    if let Err(err) = self.inner.mapper.observe_create(backend, &name, uuid, configuration).await {
                        tracing::warn!(%err, name, "collection mapping conflict on recovery auto-map");
                    }
                }
            }
            let response_data = serde_json::from_slice(&response.body).ok();
            Ok(RecoveryOutcome {
                response_status: response.status,
                response_data,
            })
        } else {
            Err(Error::BackendRejected {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).chars().take(500).collect(),
            })
        }
    }
}
