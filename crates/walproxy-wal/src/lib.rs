#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **walproxy-wal** – the Unified WAL Engine, the core of
//! the system: a durable, per-collection-ordered, at-least-once write
//! queue that guarantees both backends eventually apply every logged
//! write exactly once, in acceptance order.
//!
//! Like [`walproxy_ledger`], this crate never dials a backend itself —
//! actual replay is supplied through [`BackendReplayer`] so the engine
//! stays testable without a network.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use walproxy_store::{LogicalDocumentId, StoreAdapter, WalUpdate};
use walproxy_types::{BackendName, Error, Result, TargetInstance, WalEntry, WalStatus};

/// Row-level retry ceiling before a WAL entry is marked `failed`.
pub const WAL_MAX_RETRIES: u32 = 3;

/// Lower bound of the adaptive sync batch size (`WAL_BATCH_SIZE`).
pub const MIN_BATCH_SIZE: u32 = 50;
/// Upper bound of the adaptive sync batch size
/// (`WAL_HIGH_VOLUME_BATCH_SIZE`).
pub const MAX_BATCH_SIZE: u32 = 200;

/// The result of replaying one WAL row against one backend.
#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    /// HTTP status the replay produced. 2xx or 404 (target already
    /// absent) both count as success.
    pub status: u16,
}

impl SyncOutcome {
    /// Whether this outcome is terminal-success for the row on this
    /// backend.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 404
    }
}

/// Replays a WAL row's `(method, path, body, headers)` against a single
/// backend. Implemented by the service layer, which owns the HTTP
/// client and the collection-identity path rewrite.
#[async_trait]
pub trait BackendReplayer: Send + Sync {
    /// Replay the given request against `backend`.
    async fn replay(
        &self,
        backend: BackendName,
        method: &str,
        path: &str,
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<SyncOutcome>;
}

/// Tracks the current adaptive batch size between [`MIN_BATCH_SIZE`] and
/// [`MAX_BATCH_SIZE`], clamped toward the floor under memory/CPU pressure
/// and toward the ceiling otherwise.
pub struct AdaptiveBatch {
    current: AtomicU32,
}

impl Default for AdaptiveBatch {
    fn default() -> Self {
        Self {
            current: AtomicU32::new(MIN_BATCH_SIZE),
        }
    }
}

impl AdaptiveBatch {
    /// Current batch size.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed) as usize
    }

    /// Record the current memory/CPU pressure (0-100 scale) and adjust
    /// the batch size toward the floor or ceiling accordingly.
    pub fn record_pressure(&self, memory_pct: u8, cpu_pct: u8, memory_threshold: u8, cpu_threshold: u8) {
        let under_pressure = memory_pct >= memory_threshold || cpu_pct >= cpu_threshold;
        self.current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(if under_pressure {
                    current.saturating_sub(10).max(MIN_BATCH_SIZE)
                } else {
                    (current + 10).min(MAX_BATCH_SIZE)
                })
            })
            .ok();
    }
}

/// Summary of one sync worker pass against one backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    /// Rows claimed this pass.
    pub claimed: usize,
    /// Rows that reached `synced` this pass.
    pub synced: usize,
    /// Rows that advanced from `pending` to `executed` (first backend
    /// confirmed, the other still outstanding).
    pub partially_executed: usize,
    /// Rows that failed this attempt and remain pending, retried next pass.
    pub retried: usize,
    /// Rows that exceeded [`WAL_MAX_RETRIES`] and were marked `failed`.
    pub failed: usize,
}

/// Owns WAL row lifecycle: append, synchronous-path status updates, and
/// the background sync pass.
///
/// Generic over `S: StoreAdapter + ?Sized` so the service binary can use
/// `WalEngine<dyn StoreAdapter>` behind a single `Arc`.
pub struct WalEngine<S: StoreAdapter + ?Sized> {
    store: std::sync::Arc<S>,
}

impl<S: StoreAdapter + ?Sized> WalEngine<S> {
    /// Build an engine over the given store.
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    /// Append a new row before forwarding the synchronous write.
    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        write_id: String,
        method: String,
        path: String,
        body: Vec<u8>,
        headers: Vec<(String, String)>,
        target_instance: TargetInstance,
        executed_on: BackendName,
        collection_id: Option<String>,
    ) -> Result<WalEntry> {
        let now = Utc::now();
        let entry = WalEntry {
            write_id,
            sequence: 0,
            method,
            path,
            body,
            headers,
            target_instance,
            executed_on: Some(executed_on),
            status: WalStatus::Pending,
            collection_id,
            retry_count: 0,
            error_message: None,
            timestamp: now,
            executed_at: None,
            synced_at: None,
        };
        self.store.insert_wal(&entry).await?;
        debug!(write_id = %entry.write_id, "WAL append");
        Ok(entry)
    }

    /// Record the synchronous attempt's success.
    pub async fn mark_synchronous_success(&self, write_id: &str) -> Result<()> {
        self.store
            .mark_wal(
                write_id,
                WalUpdate {
                    status: Some(WalStatus::Executed),
                    executed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
    }

    /// Record the synchronous attempt's failure: the row stays `pending`,
    /// eligible for pure replay against either backend.
    pub async fn mark_synchronous_failure(&self, write_id: &str, error_message: String) -> Result<()> {
        let entry = self
            .store
            .get_wal(write_id)
            .await?
            .ok_or_else(|| Error::MappingMissing(format!("unknown write_id {write_id}")))?;
        self.store
            .mark_wal(
                write_id,
                WalUpdate {
                    retry_count: Some(entry.retry_count + 1),
                    error_message: Some(Some(error_message)),
                    ..Default::default()
                },
            )
            .await
    }

    /// Record the logical ID for a document observed on `backend`, so a
    /// later deletion-form conversion can resolve it.
    pub async fn observe_document_id(
        &self,
        collection_id: String,
        backend: BackendName,
        backend_document_id: String,
        logical_id: String,
    ) -> Result<()> {
        self.store
            .record_logical_document_id(&LogicalDocumentId {
                collection_id,
                backend,
                backend_document_id,
                logical_id,
            })
            .await
    }

    /// WAL counts by status, for `/wal/status` and `/wal/stats`.
    pub async fn status_summary(&self) -> Result<(Vec<(WalStatus, i64)>, Option<chrono::DateTime<Utc>>)> {
        let counts = self.store.wal_status_counts().await?;
        let oldest = self.store.oldest_pending_wal_timestamp().await?;
        Ok((counts, oldest))
    }

    /// Run one sync pass against `backend`: one tick of the background
    /// sync worker.
    ///
    /// Stops processing the claimed batch at the first row whose replay
    /// fails (distinct from a row permanently failed for deletion-form
    /// conversion, which does not block the rest of the batch): the
    /// batch is ordered by `(timestamp, sequence)`, so continuing past a
    /// still-retrying row risks syncing a later row for the same
    /// collection out of order. Any row left unprocessed by the early
    /// stop has its claim released so the next pass can pick it up.
    pub async fn sync_once(
        &self,
        backend: BackendName,
        replayer: &dyn BackendReplayer,
        batch_size: usize,
    ) -> Result<SyncStats> {
        let rows = self.store.claim_next_unsynced(backend, batch_size).await?;
        let mut stats = SyncStats {
            claimed: rows.len(),
            ..Default::default()
        };

        let mut rows = rows.into_iter();
        let mut stopped_early = false;

        for row in rows.by_ref() {
            let body = match self.prepare_replay_body(&row, backend).await {
                Ok(body) => body,
                Err(Error::DeletionConversionImpossible(reason)) => {
                    warn!(write_id = %row.write_id, reason, "deletion-form conversion impossible, failing row");
                    self.store
                        .mark_wal(
                            &row.write_id,
                            WalUpdate {
                                status: Some(WalStatus::Failed),
                                error_message: Some(Some(reason)),
                                ..Default::default()
                            },
                        )
                        .await?;
                    stats.failed += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let outcome = replayer
                .replay(backend, &row.method, &row.path, &body, &row.headers)
                .await;

            match outcome {
                Ok(outcome) if outcome.is_success() => {
                    self.handle_replay_success(&row, backend, &mut stats).await?;
                }
                Ok(outcome) => {
                    self.handle_replay_failure(
                        &row,
                        format!("backend returned status {}", outcome.status),
                        &mut stats,
                    )
                    .await?;
                    stopped_early = true;
                    break;
                }
                Err(err) => {
                    self.handle_replay_failure(&row, err.to_string(), &mut stats).await?;
                    stopped_early = true;
                    break;
                }
            }
        }

        if stopped_early {
            for remaining in rows {
                self.store.release_wal_claim(&remaining.write_id).await?;
            }
        }

        Ok(stats)
    }

    async fn handle_replay_success(
        &self,
        row: &WalEntry,
        backend: BackendName,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let single_target = row.target_instance != TargetInstance::Both;
        let already_executed_elsewhere = row.status == WalStatus::Executed;

        if single_target || already_executed_elsewhere {
            self.store
                .mark_wal(
                    &row.write_id,
                    WalUpdate {
                        status: Some(WalStatus::Synced),
                        synced_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            stats.synced += 1;
            info!(write_id = %row.write_id, "WAL row synced");
        } else {
            self.store
                .mark_wal(
                    &row.write_id,
                    WalUpdate {
                        status: Some(WalStatus::Executed),
                        executed_on: Some(backend),
                        executed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            stats.partially_executed += 1;
        }
        Ok(())
    }

    async fn handle_replay_failure(
        &self,
        row: &WalEntry,
        error_message: String,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let retry_count = row.retry_count + 1;
        if retry_count >= WAL_MAX_RETRIES {
            self.store
                .mark_wal(
                    &row.write_id,
                    WalUpdate {
                        status: Some(WalStatus::Failed),
                        retry_count: Some(retry_count),
                        error_message: Some(Some(error_message)),
                        ..Default::default()
                    },
                )
                .await?;
            stats.failed += 1;
            warn!(write_id = %row.write_id, "WAL row failed, retries exhausted");
        } else {
            self.store
                .mark_wal(
                    &row.write_id,
                    WalUpdate {
                        retry_count: Some(retry_count),
                        error_message: Some(Some(error_message)),
                        ..Default::default()
                    },
                )
                .await?;
            stats.retried += 1;
        }
        Ok(())
    }

    /// Convert a document delete expressed as `{"ids": [...]}` into a
    /// predicate delete keyed on the logical document id, when
    /// `row.body` takes that shape.
    /// Returns the original body unchanged for every other request shape.
    async fn prepare_replay_body(&self, row: &WalEntry, backend: BackendName) -> Result<Vec<u8>> {
        let Ok(serde_json::Value::Object(obj)) = serde_json::from_slice::<serde_json::Value>(&row.body) else {
            return Ok(row.body.clone());
        };
        let Some(serde_json::Value::Array(ids)) = obj.get("ids") else {
            return Ok(row.body.clone());
        };
        if obj.len() != 1 {
            // Only a bare `{"ids": [...]}` payload is a pure ID-keyed delete;
            // anything with additional fields is left untouched.
            return Ok(row.body.clone());
        }
        let Some(collection_id) = row.collection_id.as_deref() else {
            return Ok(row.body.clone());
        };

        let mut logical_ids = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(id_str) = id.as_str() else {
                return Ok(row.body.clone());
            };
            match self.store.logical_document_id(collection_id, backend, id_str).await? {
                Some(logical_id) => logical_ids.push(logical_id),
                None => {
                    return Err(Error::DeletionConversionImpossible(format!(
                        "no logical document id on file for {id_str} in collection {collection_id} on {backend}"
                    )))
                }
            }
        }

        let predicate = if logical_ids.len() == 1 {
            serde_json::json!({ "$eq": logical_ids[0] })
        } else {
            serde_json::json!({ "$in": logical_ids })
        };
        let converted = serde_json::json!({ "where": { "document_id": predicate } });
        Ok(serde_json::to_vec(&converted).expect("serializable json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use walproxy_store::SqliteStore;

    struct ScriptedReplayer {
        status: u16,
    }

    #[async_trait]
    impl BackendReplayer for ScriptedReplayer {
        async fn replay(
            &self,
            _backend: BackendName,
            _method: &str,
            _path: &str,
            _body: &[u8],
            _headers: &[(String, String)],
        ) -> Result<SyncOutcome> {
            Ok(SyncOutcome { status: self.status })
        }
    }

    async fn engine() -> WalEngine<SqliteStore> {
        WalEngine::new(Arc::new(SqliteStore::in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn both_target_row_goes_executed_then_synced() {
        let engine = engine().await;
        let entry = engine
            .append(
                "w-1".to_string(),
                "POST".to_string(),
                "/api/v2/.../collections".to_string(),
                b"{}".to_vec(),
                vec![],
                TargetInstance::Both,
                BackendName::Primary,
                Some("docs".to_string()),
            )
            .await
            .unwrap();
        engine.mark_synchronous_success(&entry.write_id).await.unwrap();

        let replayer = ScriptedReplayer { status: 201 };
        let stats = engine.sync_once(BackendName::Replica, &replayer, 10).await.unwrap();
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.synced, 1);

        let (counts, _) = engine.status_summary().await.unwrap();
        let synced_count = counts.iter().find(|(s, _)| *s == WalStatus::Synced).map(|(_, c)| *c);
        assert_eq!(synced_count, Some(1));
    }

    #[tokio::test]
    async fn pending_row_transitions_to_executed_on_first_sync_success() {
        let engine = engine().await;
        let entry = engine
            .append(
                "w-2".to_string(),
                "POST".to_string(),
                "/api/v2/.../collections".to_string(),
                b"{}".to_vec(),
                vec![],
                TargetInstance::Both,
                BackendName::Primary,
                Some("docs".to_string()),
            )
            .await
            .unwrap();
        // Synchronous attempt on primary failed; row stays pending.
        engine
            .mark_synchronous_failure(&entry.write_id, "connection refused".to_string())
            .await
            .unwrap();

        let replayer = ScriptedReplayer { status: 201 };
        let stats = engine.sync_once(BackendName::Replica, &replayer, 10).await.unwrap();
        assert_eq!(stats.partially_executed, 1);
        assert_eq!(stats.synced, 0);

        let stats2 = engine.sync_once(BackendName::Primary, &replayer, 10).await.unwrap();
        assert_eq!(stats2.synced, 1);
    }

    #[tokio::test]
    async fn single_target_row_syncs_after_one_success() {
        let engine = engine().await;
        let entry = engine
            .append(
                "w-3".to_string(),
                "DELETE".to_string(),
                "/api/v2/.../collections/docs".to_string(),
                b"{}".to_vec(),
                vec![],
                TargetInstance::Replica,
                BackendName::Primary,
                Some("docs".to_string()),
            )
            .await
            .unwrap();
        engine.mark_synchronous_failure(&entry.write_id, "down".to_string()).await.unwrap();

        let replayer = ScriptedReplayer { status: 404 };
        let stats = engine.sync_once(BackendName::Replica, &replayer, 10).await.unwrap();
        assert_eq!(stats.synced, 1);
    }

    #[tokio::test]
    async fn repeated_failures_mark_row_failed_after_max_retries() {
        let engine = engine().await;
        let entry = engine
            .append(
                "w-4".to_string(),
                "POST".to_string(),
                "/api/v2/.../add".to_string(),
                b"{}".to_vec(),
                vec![],
                TargetInstance::Both,
                BackendName::Primary,
                Some("docs".to_string()),
            )
            .await
            .unwrap();
        engine.mark_synchronous_success(&entry.write_id).await.unwrap();

        let replayer = ScriptedReplayer { status: 500 };
        for _ in 0..WAL_MAX_RETRIES {
            engine.sync_once(BackendName::Replica, &replayer, 10).await.unwrap();
        }

        let fetched = engine.store.get_wal("w-4").await.unwrap().unwrap();
        assert_eq!(fetched.status, WalStatus::Failed);
    }

    #[tokio::test]
    async fn deletion_form_conversion_requires_logical_id_on_file() {
        let engine = engine().await;
        let body = serde_json::to_vec(&serde_json::json!({ "ids": ["backend-doc-1"] })).unwrap();
        let entry = engine
            .append(
                "w-5".to_string(),
                "POST".to_string(),
                "/api/v2/.../delete".to_string(),
                body,
                vec![],
                TargetInstance::Both,
                BackendName::Primary,
                Some("docs".to_string()),
            )
            .await
            .unwrap();
        engine.mark_synchronous_success(&entry.write_id).await.unwrap();

        let replayer = ScriptedReplayer { status: 200 };
        let stats = engine.sync_once(BackendName::Replica, &replayer, 10).await.unwrap();
        assert_eq!(stats.failed, 1);

        let fetched = engine.store.get_wal("w-5").await.unwrap().unwrap();
        assert_eq!(fetched.status, WalStatus::Failed);
    }

    #[tokio::test]
    async fn deletion_form_conversion_translates_to_predicate_delete() {
        let engine = engine().await;
        engine
            .observe_document_id(
                "docs".to_string(),
                BackendName::Replica,
                "backend-doc-1".to_string(),
                "logical-1".to_string(),
            )
            .await
            .unwrap();

        let body = serde_json::to_vec(&serde_json::json!({ "ids": ["backend-doc-1"] })).unwrap();
        let entry = engine
            .append(
                "w-6".to_string(),
                "POST".to_string(),
                "/api/v2/.../delete".to_string(),
                body,
                vec![],
                TargetInstance::Both,
                BackendName::Primary,
                Some("docs".to_string()),
            )
            .await
            .unwrap();
        engine.mark_synchronous_success(&entry.write_id).await.unwrap();

        let replayer = ScriptedReplayer { status: 200 };
        let stats = engine.sync_once(BackendName::Replica, &replayer, 10).await.unwrap();
        assert_eq!(stats.synced, 1);
    }

    #[test]
    fn adaptive_batch_shrinks_under_pressure_and_grows_when_idle() {
        let batch = AdaptiveBatch::default();
        assert_eq!(batch.current(), MIN_BATCH_SIZE as usize);
        batch.record_pressure(10, 10, 80, 80);
        assert!(batch.current() > MIN_BATCH_SIZE as usize);
        for _ in 0..20 {
            batch.record_pressure(10, 10, 80, 80);
        }
        assert_eq!(batch.current(), MAX_BATCH_SIZE as usize);
        batch.record_pressure(90, 10, 80, 80);
        assert!(batch.current() < MAX_BATCH_SIZE as usize);
    }
}
