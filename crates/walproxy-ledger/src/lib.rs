#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **walproxy-ledger** – the Transaction Safety Ledger.
//!
//! Every write is logged `ATTEMPTING` before a backend is even chosen, so
//! a crash between logging and routing still leaves a forensic,
//! recoverable record. This crate owns the ledger's state machine; it is
//! deliberately ignorant of how a request is actually replayed or how
//! backend health is determined — both are supplied through the
//! [`Replayer`] trait so this crate has no dependency on the router or
//! health prober.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use walproxy_store::{LedgerUpdate, StoreAdapter};
use walproxy_types::{LedgerStatus, LedgerTransaction, Result, TargetInstance};

/// Default recovery batch size per worker tick.
pub const DEFAULT_RECOVERY_BATCH: usize = 50;

/// The outcome of replaying a previously-failed transaction.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    /// HTTP status the replay produced.
    pub response_status: u16,
    /// Response payload captured on completion.
    pub response_data: Option<serde_json::Value>,
}

/// Supplies the two things the recovery worker needs but must not own:
/// current backend health, and the ability to actually replay a request.
#[async_trait]
pub trait Replayer: Send + Sync {
    /// Whether at least one backend in `target` is currently healthy.
    async fn any_backend_healthy(&self, target: TargetInstance) -> bool;

    /// Replay `txn` against a live backend. Errors map to a failed
    /// recovery attempt; `Ok` values are always treated as success
    /// (matching the WAL sync worker's 2xx/404-is-success rule is the
    /// caller's responsibility before returning `Ok`).
    async fn replay(&self, txn: &LedgerTransaction) -> Result<RecoveryOutcome>;
}

/// Classification of a synchronous write failure, computed by the caller
/// and handed to [`SafetyLedger::mark_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The backend appeared unhealthy (connection refused, timeout, 502/503)
    /// despite a cached-healthy verdict — the timing-gap case.
    TimingGap,
    /// A live backend rejected the request with a client error (4xx).
    ClientRejected,
    /// Any other infrastructure failure not indicating a timing gap.
    Other,
}

/// Owns the ledger's lifecycle: logging before routing, classifying
/// synchronous failures, and periodically recovering timing-gap rows.
///
/// Generic over `S: StoreAdapter + ?Sized` so the service binary can use
/// `SafetyLedger<dyn StoreAdapter>` behind a single `Arc`.
pub struct SafetyLedger<S: StoreAdapter + ?Sized> {
    store: std::sync::Arc<S>,
}

impl<S: StoreAdapter + ?Sized> SafetyLedger<S> {
    /// Build a ledger over the given store.
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    /// Log a write `ATTEMPTING`, before backend selection, so a crash
    /// between logging and routing still leaves a recoverable record.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_attempting(
        &self,
        method: String,
        path: String,
        data: Option<serde_json::Value>,
        headers: Vec<(String, String)>,
        target_instance: TargetInstance,
        client_session: Option<String>,
        client_ip: Option<String>,
        operation_type: String,
    ) -> Result<LedgerTransaction> {
        let now = Utc::now();
        let txn = LedgerTransaction {
            transaction_id: Uuid::new_v4(),
            method,
            path,
            data,
            headers,
            status: LedgerStatus::Attempting,
            is_timing_gap_failure: false,
            retry_count: 0,
            max_retries: LedgerTransaction::DEFAULT_MAX_RETRIES,
            next_retry_at: None,
            target_instance,
            client_session,
            client_ip,
            operation_type,
            response_status: None,
            response_data: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_ledger(&txn).await?;
        tracing::debug!(transaction_id = %txn.transaction_id, "ledger ATTEMPTING");
        Ok(txn)
    }

    /// Mark a transaction `COMPLETED` with its synchronous response.
    pub async fn mark_completed(
        &self,
        transaction_id: Uuid,
        response_status: u16,
        response_data: Option<serde_json::Value>,
    ) -> Result<()> {
        self.store
            .update_ledger(
                transaction_id,
                LedgerUpdate {
                    status: Some(LedgerStatus::Completed),
                    response_status: Some(Some(response_status)),
                    response_data: Some(response_data),
                    ..Default::default()
                },
            )
            .await?;
        tracing::debug!(%transaction_id, "ledger COMPLETED");
        Ok(())
    }

    /// Classify and record a synchronous failure. Client
    /// 4xx rejections from a live backend go straight to `ABANDONED`;
    /// everything else becomes `FAILED`, tagged with
    /// `is_timing_gap_failure` when appropriate so the recovery worker
    /// can prioritize it.
    pub async fn mark_failure(
        &self,
        transaction_id: Uuid,
        class: FailureClass,
        failure_reason: String,
    ) -> Result<()> {
        let status = if class == FailureClass::ClientRejected {
            LedgerStatus::Abandoned
        } else {
            LedgerStatus::Failed
        };
        let next_retry_at = if status == LedgerStatus::Failed {
            Some(Utc::now() + LedgerTransaction::backoff_for(0))
        } else {
            None
        };
        self.store
            .update_ledger(
                transaction_id,
                LedgerUpdate {
                    status: Some(status),
                    is_timing_gap_failure: Some(class == FailureClass::TimingGap),
                    next_retry_at: Some(next_retry_at),
                    failure_reason: Some(Some(failure_reason)),
                    ..Default::default()
                },
            )
            .await?;
        tracing::warn!(%transaction_id, ?class, "ledger FAILED/ABANDONED");
        Ok(())
    }

    /// Fetch a transaction by ID, for `/transaction/safety/status` drill-down
    /// and client recovery polling.
    pub async fn get(&self, transaction_id: Uuid) -> Result<Option<LedgerTransaction>> {
        self.store.get_ledger(transaction_id).await
    }

    /// Status counts and timing-gap count, for `/transaction/safety/status`.
    pub async fn status_summary(&self) -> Result<(Vec<(String, i64)>, i64)> {
        let counts = self.store.ledger_status_counts().await?;
        let timing_gaps = self.store.ledger_timing_gap_count().await?;
        Ok((counts, timing_gaps))
    }

    /// Run one pass of the recovery worker.
    /// Exposed separately from any scheduling loop so tests and the
    /// `/transaction/safety/recovery/trigger` endpoint can drive a single
    /// pass synchronously.
    pub async fn recover_once(
        &self,
        replayer: &dyn Replayer,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<RecoveryStats> {
        let candidates = self.store.fetch_recoverable_ledger(limit, now).await?;
        let mut stats = RecoveryStats::default();
        for txn in candidates {
            stats.attempted += 1;
            if !replayer.any_backend_healthy(txn.target_instance).await {
                self.store.release_ledger_claim(txn.transaction_id).await?;
                tracing::debug!(transaction_id = %txn.transaction_id, "no healthy backend, deferring recovery");
                continue;
            }
            match replayer.replay(&txn).await {
                Ok(outcome) => {
                    self.store
                        .update_ledger(
                            txn.transaction_id,
                            LedgerUpdate {
                                status: Some(LedgerStatus::Recovered),
                                response_status: Some(Some(outcome.response_status)),
                                response_data: Some(outcome.response_data),
                                ..Default::default()
                            },
                        )
                        .await?;
                    stats.recovered += 1;
                    tracing::info!(transaction_id = %txn.transaction_id, "ledger RECOVERED");
                }
                Err(err) => {
                    let retry_count = txn.retry_count + 1;
                    if retry_count >= txn.max_retries {
                        self.store
                            .update_ledger(
                                txn.transaction_id,
                                LedgerUpdate {
                                    status: Some(LedgerStatus::Abandoned),
                                    retry_count: Some(retry_count),
                                    failure_reason: Some(Some(err.to_string())),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        stats.abandoned += 1;
                        tracing::warn!(transaction_id = %txn.transaction_id, "ledger ABANDONED, retries exhausted");
                    } else {
                        let next_retry_at = now + LedgerTransaction::backoff_for(retry_count);
                        self.store
                            .update_ledger(
                                txn.transaction_id,
                                LedgerUpdate {
                                    retry_count: Some(retry_count),
                                    next_retry_at: Some(Some(next_retry_at)),
                                    failure_reason: Some(Some(err.to_string())),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        stats.still_failed += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}

/// Summary of one recovery worker pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryStats {
    /// Rows considered for recovery this pass.
    pub attempted: usize,
    /// Rows that transitioned to `RECOVERED`.
    pub recovered: usize,
    /// Rows that transitioned to `ABANDONED`.
    pub abandoned: usize,
    /// Rows that remain `FAILED` with a new backoff deadline.
    pub still_failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use walproxy_store::SqliteStore;

    struct AlwaysHealthyAlwaysSucceeds {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Replayer for AlwaysHealthyAlwaysSucceeds {
        async fn any_backend_healthy(&self, _target: TargetInstance) -> bool {
            true
        }
        async fn replay(&self, _txn: &LedgerTransaction) -> Result<RecoveryOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RecoveryOutcome {
                response_status: 200,
                response_data: None,
            })
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Replayer for AlwaysFails {
        async fn any_backend_healthy(&self, _target: TargetInstance) -> bool {
            true
        }
        async fn replay(&self, _txn: &LedgerTransaction) -> Result<RecoveryOutcome> {
            Err(walproxy_types::Error::BackendUnavailable("down".to_string()))
        }
    }

    struct NeverHealthy;

    #[async_trait]
    impl Replayer for NeverHealthy {
        async fn any_backend_healthy(&self, _target: TargetInstance) -> bool {
            false
        }
        async fn replay(&self, _txn: &LedgerTransaction) -> Result<RecoveryOutcome> {
            panic!("should never be called when no backend is healthy")
        }
    }

    async fn ledger() -> SafetyLedger<SqliteStore> {
        SafetyLedger::new(Arc::new(SqliteStore::in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn log_attempting_then_mark_completed() {
        let ledger = ledger().await;
        let txn = ledger
            .log_attempting(
                "POST".to_string(),
                "/api/v2/.../collections".to_string(),
                None,
                vec![],
                TargetInstance::Both,
                None,
                None,
                "create_collection".to_string(),
            )
            .await
            .unwrap();

        ledger.mark_completed(txn.transaction_id, 200, None).await.unwrap();
        let fetched = ledger.get(txn.transaction_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, LedgerStatus::Completed);
    }

    #[tokio::test]
    async fn timing_gap_failure_is_recoverable_after_backoff_elapses() {
        let ledger = ledger().await;
        let txn = ledger
            .log_attempting(
                "POST".to_string(),
                "/api/v2/.../add".to_string(),
                None,
                vec![],
                TargetInstance::Primary,
                None,
                None,
                "add_documents".to_string(),
            )
            .await
            .unwrap();

        ledger
            .mark_failure(txn.transaction_id, FailureClass::TimingGap, "connection refused".to_string())
            .await
            .unwrap();

        let fetched = ledger.get(txn.transaction_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, LedgerStatus::Failed);
        assert!(fetched.is_timing_gap_failure);

        let future = Utc::now() + chrono::Duration::seconds(120);
        let replayer = AlwaysHealthyAlwaysSucceeds { calls: AtomicUsize::new(0) };
        let stats = ledger.recover_once(&replayer, future, 10).await.unwrap();
        assert_eq!(stats.recovered, 1);
        assert_eq!(replayer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_rejection_goes_straight_to_abandoned() {
        let ledger = ledger().await;
        let txn = ledger
            .log_attempting(
                "POST".to_string(),
                "/api/v2/.../add".to_string(),
                None,
                vec![],
                TargetInstance::Primary,
                None,
                None,
                "add_documents".to_string(),
            )
            .await
            .unwrap();

        ledger
            .mark_failure(txn.transaction_id, FailureClass::ClientRejected, "400 bad request".to_string())
            .await
            .unwrap();

        let fetched = ledger.get(txn.transaction_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, LedgerStatus::Abandoned);

        let stats = ledger.recover_once(&AlwaysHealthyAlwaysSucceeds { calls: AtomicUsize::new(0) }, Utc::now(), 10).await.unwrap();
        assert_eq!(stats.attempted, 0);
    }

    #[tokio::test]
    async fn recovery_defers_when_no_backend_healthy() {
        let ledger = ledger().await;
        let txn = ledger
            .log_attempting(
                "POST".to_string(),
                "/api/v2/.../add".to_string(),
                None,
                vec![],
                TargetInstance::Primary,
                None,
                None,
                "add_documents".to_string(),
            )
            .await
            .unwrap();
        ledger
            .mark_failure(txn.transaction_id, FailureClass::TimingGap, "refused".to_string())
            .await
            .unwrap();

        let future = Utc::now() + chrono::Duration::seconds(120);
        let stats = ledger.recover_once(&NeverHealthy, future, 10).await.unwrap();
        assert_eq!(stats.attempted, 1);
        assert_eq!(stats.recovered, 0);

        let fetched = ledger.get(txn.transaction_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, LedgerStatus::Failed);
    }

    #[tokio::test]
    async fn repeated_failures_eventually_abandon() {
        let ledger = ledger().await;
        let txn = ledger
            .log_attempting(
                "POST".to_string(),
                "/api/v2/.../add".to_string(),
                None,
                vec![],
                TargetInstance::Primary,
                None,
                None,
                "add_documents".to_string(),
            )
            .await
            .unwrap();
        ledger
            .mark_failure(txn.transaction_id, FailureClass::TimingGap, "refused".to_string())
            .await
            .unwrap();

        let mut now = Utc::now();
        for _ in 0..LedgerTransaction::DEFAULT_MAX_RETRIES {
            now += chrono::Duration::hours(1);
            ledger.recover_once(&AlwaysFails, now, 10).await.unwrap();
        }

        let fetched = ledger.get(txn.transaction_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, LedgerStatus::Abandoned);
    }
}
