//! Background workers: Health Prober, WAL Sync Worker, Ledger Recovery
//! Worker. Each is a loop around the owning crate's single-tick method,
//! parameterized by its configured interval.

use std::sync::Arc;

use tracing::{error, info};
use walproxy_types::BackendName;
use walproxy_wal::AdaptiveBatch;

use crate::backend_client::LedgerReplayer;
use crate::state::AppState;

/// Drive the Health Prober forever at its configured interval.
pub async fn run_health_prober(state: AppState) {
    let interval = state.config.check_interval;
    info!(?interval, "starting health prober");
    state.health.run(interval).await;
}

/// Drive the WAL sync worker forever: one pass per currently-healthy
/// backend, every tick, with the batch size adapted to memory/CPU
/// pressure.
pub async fn run_wal_sync(state: AppState) {
    let interval = state.config.wal_sync_interval;
    let batch = Arc::new(AdaptiveBatch::default());
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let memory_pct = sample_memory_pressure(state.config.max_memory_mb);
        batch.record_pressure(memory_pct, 0, state.config.wal_memory_threshold, state.config.wal_cpu_threshold);
        let batch_size = batch.current();

        for backend in [BackendName::Primary, BackendName::Replica] {
            if !state.health.is_healthy(backend) {
                continue;
            }
            match state.wal.sync_once(backend, state.replayer.as_ref(), batch_size).await {
                Ok(stats) if stats.claimed > 0 => {
                    info!(
                        %backend,
                        claimed = stats.claimed,
                        synced = stats.synced,
                        partially_executed = stats.partially_executed,
                        retried = stats.retried,
                        failed = stats.failed,
                        "WAL sync pass"
                    );
                }
                Ok(_) => {}
                Err(err) => error!(%backend, %err, "WAL sync pass failed"),
            }
        }
    }
}

/// Drive the ledger recovery worker forever at its configured interval.
pub async fn run_ledger_recovery(state: AppState) {
    let interval = state.config.check_interval;
    let replayer = LedgerReplayer::new(state.replayer.clone(), state.health.clone());
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match state
            .ledger
            .recover_once(&replayer, chrono::Utc::now(), walproxy_ledger::DEFAULT_RECOVERY_BATCH)
            .await
        {
            Ok(stats) if stats.attempted > 0 => {
                info!(
                    attempted = stats.attempted,
                    recovered = stats.recovered,
                    abandoned = stats.abandoned,
                    still_failed = stats.still_failed,
                    "ledger recovery pass"
                );
            }
            Ok(_) => {}
            Err(err) => error!(%err, "ledger recovery pass failed"),
        }
    }
}

/// Approximate resident-memory pressure as a percentage of
/// `max_memory_mb`, read from `/proc/self/statm` on Linux. This is only
/// an internal signal for the adaptive batch size already built into
/// `walproxy-wal`, not a resource-telemetry emission surface.
#[cfg(target_os = "linux")]
fn sample_memory_pressure(max_memory_mb: u64) -> u8 {
    let Ok(contents) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let Some(resident_pages) = contents.split_whitespace().nth(1) else {
        return 0;
    };
    let Ok(resident_pages) = resident_pages.parse::<u64>() else {
        return 0;
    };
    let page_size_kb = 4;
    let resident_mb = resident_pages * page_size_kb / 1024;
    if max_memory_mb == 0 {
        return 0;
    }
    ((resident_mb * 100) / max_memory_mb).min(100) as u8
}

#[cfg(not(target_os = "linux"))]
fn sample_memory_pressure(_max_memory_mb: u64) -> u8 {
    0
}
