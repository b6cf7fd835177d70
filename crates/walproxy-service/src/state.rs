//! Shared application state wiring the store, health prober, mapper,
//! ledger, WAL engine, and router together behind a single
//! `Arc<dyn StoreAdapter>`.

use std::sync::Arc;

use walproxy_health::HealthProber;
use walproxy_ledger::SafetyLedger;
use walproxy_mapper::CollectionMapper;
use walproxy_router::Router;
use walproxy_store::StoreAdapter;
use walproxy_wal::WalEngine;

use crate::backend_client::HttpReplayer;
use crate::config::Config;

/// Everything an axum handler needs, cloned cheaply per-request (every
/// field is an `Arc` or a plain `Arc`-wrapped newtype).
#[derive(Clone)]
pub struct AppState {
    /// Resolved runtime configuration.
    pub config: Arc<Config>,
    /// The durable store, behind a trait object so Postgres and SQLite
    /// backends are interchangeable without generic plumbing.
    pub store: Arc<dyn StoreAdapter>,
    /// The Collection Identity Mapper.
    pub mapper: Arc<CollectionMapper<dyn StoreAdapter>>,
    /// The Transaction Safety Ledger.
    pub ledger: Arc<SafetyLedger<dyn StoreAdapter>>,
    /// The Unified WAL Engine.
    pub wal: Arc<WalEngine<dyn StoreAdapter>>,
    /// The Health Prober.
    pub health: Arc<HealthProber>,
    /// The Health & Routing Engine.
    pub router: Arc<Router>,
    /// The HTTP client wrapper that actually dials the backends.
    pub replayer: Arc<HttpReplayer>,
}
