//! **walproxy** – reverse proxy and write-ahead replication engine
//! fronting two instances of a vector/document database.
//!
//! Wires together the Durable Store Adapter, Health Prober, Collection
//! Identity Mapper, Transaction Safety Ledger, Unified WAL Engine, and
//! Health & Routing Engine behind an `axum` HTTP surface (the Proxy
//! Frontend and Observability Surface).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use walproxy_health::HealthProber;
use walproxy_ledger::SafetyLedger;
use walproxy_mapper::CollectionMapper;
use walproxy_router::Router as WalRouter;
use walproxy_store::{PostgresStore, StoreAdapter};
use walproxy_types::{Backend, BackendName};
use walproxy_wal::WalEngine;

use walproxy_service::backend_client::HttpReplayer;
use walproxy_service::config::Config;
use walproxy_service::{create_app, init_logging, AppState};

#[derive(Parser, Debug)]
#[command(name = "walproxy", about = "WAL replication proxy for a two-backend vector database deployment")]
struct Cli {
    /// Override `PORT`.
    #[arg(long)]
    port: Option<u16>,
    /// Override `LOG_LEVEL`.
    #[arg(long)]
    log_level: Option<String>,
    /// Override `DATABASE_URL`.
    #[arg(long)]
    database_url: Option<String>,
    /// Override `PRIMARY_URL`.
    #[arg(long)]
    primary_url: Option<String>,
    /// Override `REPLICA_URL`.
    #[arg(long)]
    replica_url: Option<String>,
}

impl Cli {
    fn apply_overrides(&self) {
        if let Some(port) = self.port {
            std::env::set_var("PORT", port.to_string());
        }
        if let Some(log_level) = &self.log_level {
            std::env::set_var("LOG_LEVEL", log_level);
        }
        if let Some(database_url) = &self.database_url {
            std::env::set_var("DATABASE_URL", database_url);
        }
        if let Some(primary_url) = &self.primary_url {
            std::env::set_var("PRIMARY_URL", primary_url);
        }
        if let Some(replica_url) = &self.replica_url {
            std::env::set_var("REPLICA_URL", replica_url);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    cli.apply_overrides();

    let config = Config::from_env().context("failed to load configuration")?;
    init_logging(&config.log_level);

    info!(port = config.port, "starting walproxy");

    let store: Arc<dyn StoreAdapter> = Arc::new(
        PostgresStore::connect(&config.database_url)
            .await
            .context("failed to connect to durable store")?,
    );

    let health = Arc::new(HealthProber::new(
        vec![
            Backend::new(BackendName::Primary, config.primary_url.clone(), 0),
            Backend::new(BackendName::Replica, config.replica_url.clone(), 1),
        ],
        config.failure_threshold,
    ));

    let mapper: Arc<CollectionMapper<dyn StoreAdapter>> = Arc::new(CollectionMapper::new(store.clone()));
    let ledger: Arc<SafetyLedger<dyn StoreAdapter>> = Arc::new(SafetyLedger::new(store.clone()));
    let wal: Arc<WalEngine<dyn StoreAdapter>> = Arc::new(WalEngine::new(store.clone()));
    let router = Arc::new(WalRouter::new(health.clone(), config.read_replica_ratio, config.consistency_window));
    let replayer = Arc::new(HttpReplayer::new(&config, mapper.clone())?);

    let state = AppState {
        config: Arc::new(config),
        store,
        mapper,
        ledger,
        wal,
        health,
        router,
        replayer,
    };

    tokio::spawn(walproxy_service::workers::run_health_prober(state.clone()));
    tokio::spawn(walproxy_service::workers::run_wal_sync(state.clone()));
    tokio::spawn(walproxy_service::workers::run_ledger_recovery(state.clone()));

    let port = state.config.port;
    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;

    info!(port, "walproxy listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("walproxy shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
    info!("shutdown signal received");
}
