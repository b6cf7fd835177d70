//! Configuration layer — a single `Config::from_env` entry point
//! covering every environment-driven setting the proxy reads, plus the
//! process-level `PORT`/`LOG_LEVEL` knobs. Required keys missing at
//! startup abort the process with a descriptive error; everything else
//! falls back to its documented default, logging a warning if the
//! environment value was present but unparsable.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

/// Fully resolved runtime configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the primary backend.
    pub primary_url: String,
    /// Base URL of the replica backend.
    pub replica_url: String,
    /// Relational store DSN.
    pub database_url: String,
    /// Port the proxy listens on.
    pub port: u16,
    /// `tracing` env-filter directive.
    pub log_level: String,

    /// Health Prober tick period.
    pub check_interval: Duration,
    /// Consecutive failures before a backend is marked down.
    pub failure_threshold: u32,

    /// WAL sync worker tick period.
    pub wal_sync_interval: Duration,
    /// Floor of the adaptive sync batch size.
    pub wal_batch_size: u32,
    /// Ceiling of the adaptive sync batch size.
    pub wal_high_volume_batch_size: u32,
    /// Memory pressure percentage that clamps the batch size toward the floor.
    pub wal_memory_threshold: u8,
    /// CPU pressure percentage that clamps the batch size toward the floor.
    pub wal_cpu_threshold: u8,
    /// Per-row retry ceiling before a WAL entry is marked `failed`.
    pub wal_retry_attempts: u32,
    /// Delay between WAL row retries.
    pub wal_retry_delay: Duration,
    /// Whether deletion-form conversion is enabled on replay.
    pub wal_deletion_conversion: bool,

    /// Fraction of reads routed to the replica.
    pub read_replica_ratio: f64,
    /// Post-write read stickiness window.
    pub consistency_window: Duration,

    /// Deadline for a single backend call.
    pub request_timeout: Duration,
    /// Maximum concurrent in-flight sync requests per backend.
    pub max_workers: usize,
    /// Soft memory ceiling used to compute adaptive-batch pressure.
    pub max_memory_mb: u64,

    /// Retention window for WAL rows.
    pub wal_retention_days: u32,
    /// Retention window for ledger rows.
    pub ledger_retention_days: u32,
    /// Retention window for health metrics (reserved for a future
    /// health-history table; currently unused by any store table).
    pub health_metrics_retention_days: u32,
}

impl Config {
    /// Load configuration from the process environment (after loading a
    /// local `.env` file, if present). Fails fast on a missing required
    /// key; everything else falls back to its documented default.
    pub fn from_env() -> Result<Self> {
        let primary_url = required("PRIMARY_URL")?;
        let replica_url = required("REPLICA_URL")?;
        let database_url = required("DATABASE_URL")?;

        Ok(Self {
            primary_url,
            replica_url,
            database_url,
            port: parse_or_default("PORT", 8080),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            check_interval: Duration::from_secs(parse_or_default("CHECK_INTERVAL", 30)),
            failure_threshold: parse_or_default("FAILURE_THRESHOLD", 3),

            wal_sync_interval: Duration::from_secs(parse_or_default("WAL_SYNC_INTERVAL", 10)),
            wal_batch_size: parse_or_default("WAL_BATCH_SIZE", 50),
            wal_high_volume_batch_size: parse_or_default("WAL_HIGH_VOLUME_BATCH_SIZE", 200),
            wal_memory_threshold: parse_or_default("WAL_MEMORY_THRESHOLD", 80),
            wal_cpu_threshold: parse_or_default("WAL_CPU_THRESHOLD", 80),
            wal_retry_attempts: parse_or_default("WAL_RETRY_ATTEMPTS", 3),
            wal_retry_delay: Duration::from_secs(parse_or_default("WAL_RETRY_DELAY", 5)),
            wal_deletion_conversion: parse_or_default("WAL_DELETION_CONVERSION", true),

            read_replica_ratio: parse_or_default("READ_REPLICA_RATIO", 0.8),
            consistency_window: Duration::from_secs(parse_or_default("CONSISTENCY_WINDOW", 30)),

            request_timeout: Duration::from_secs(parse_or_default("REQUEST_TIMEOUT", 15)),
            max_workers: parse_or_default("MAX_WORKERS", 3usize),
            max_memory_mb: parse_or_default("MAX_MEMORY_MB", 450),

            wal_retention_days: parse_or_default("WAL_RETENTION_DAYS", 7),
            ledger_retention_days: parse_or_default("LEDGER_RETENTION_DAYS", 7),
            health_metrics_retention_days: parse_or_default("HEALTH_METRICS_RETENTION_DAYS", 7),
        })
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

fn parse_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, raw, "failed to parse environment variable, using default");
            default
        }),
        Err(_) => default,
    }
}
