//! Library surface for `walproxy`, split out from `main.rs` so
//! integration tests can build the same `axum::Router` the binary
//! serves, against a local mock backend and a `SqliteStore` substitute.

pub mod backend_client;
pub mod config;
pub mod error_response;
pub mod handlers;
pub mod state;
pub mod workers;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use state::AppState;

/// Maximum request body the proxy will buffer before rejecting the
/// request, independent of whatever limit the backend itself enforces.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Build the full HTTP surface: the Proxy Frontend fallback plus every
/// Observability Surface route.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/wal/status", get(handlers::wal_status_handler))
        .route("/wal/stats", get(handlers::wal_status_handler))
        .route("/transaction/safety/status", get(handlers::ledger_status_handler))
        .route(
            "/transaction/safety/recovery/trigger",
            post(handlers::recovery_trigger_handler),
        )
        .route("/transaction/safety/cleanup", post(handlers::cleanup_handler))
        .fallback(handlers::proxy_handler)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

/// Initialize the global `tracing` subscriber. Safe to call once per
/// process; the binary is the only intended caller.
pub fn init_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();
}
