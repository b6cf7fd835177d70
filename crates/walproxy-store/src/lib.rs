#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **walproxy-store** – Durable store adapter for the WAL replication
//! proxy.
//!
//! Thin contract over a relational database supporting row-level
//! transactions and JSON columns. The production backend
//! is Postgres; a SQLite-backed implementation of the same trait is also
//! provided for fast, network-free tests (see [`sqlite::SqliteStore`]).
//!
//! All writers use `ON CONFLICT ... DO NOTHING`/`DO UPDATE` idempotent
//! semantics so at-least-once callers never duplicate rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use walproxy_types::{
    BackendName, CollectionMapping, LedgerTransaction, Result, TargetInstance, WalEntry, WalStatus,
};

pub mod postgres;
#[cfg(feature = "test-util")]
pub mod sqlite;

pub use postgres::PostgresStore;
#[cfg(feature = "test-util")]
pub use sqlite::SqliteStore;

/// Deadline for any single store operation.
pub const STORE_DEADLINE: std::time::Duration = std::time::Duration::from_secs(15);

/// A logical document ID recorded so WAL replay can perform the
/// deletion-form conversion when a backend assigns its own per-backend
/// document IDs.
#[derive(Debug, Clone)]
pub struct LogicalDocumentId {
    /// Collection the document belongs to.
    pub collection_id: String,
    /// Backend the `backend_document_id` is valid on.
    pub backend: BackendName,
    /// The ID that backend assigned to the document.
    pub backend_document_id: String,
    /// The stable, backend-independent logical ID.
    pub logical_id: String,
}

/// The typed operations the rest of the proxy needs from the relational
/// store.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    // WAL ---------------------------------------------------------------

    /// Insert a new WAL row. Idempotent on `write_id`: a duplicate insert
    /// is a no-op and returns `Ok(())`.
    async fn insert_wal(&self, entry: &WalEntry) -> Result<()>;

    /// Fetch a WAL row by its `write_id`.
    async fn get_wal(&self, write_id: &str) -> Result<Option<WalEntry>>;

    /// Claim the next batch of rows eligible for sync against `target`,
    /// ordered by `(timestamp, sequence)` ascending. Implementations must
    /// ensure two concurrent callers never claim the same row: the
    /// claimed rows are marked in-flight in the same transaction as the
    /// `SELECT ... FOR UPDATE SKIP LOCKED` (or equivalent), before
    /// commit, so the lock still means something once the transaction
    /// ends. A claimed row stays excluded from future claims until
    /// [`StoreAdapter::mark_wal`] or [`StoreAdapter::release_wal_claim`]
    /// clears it.
    async fn claim_next_unsynced(
        &self,
        target: BackendName,
        batch_size: usize,
    ) -> Result<Vec<WalEntry>>;

    /// Update a WAL row's status and associated bookkeeping fields. Also
    /// clears the row's in-flight claim, regardless of which fields in
    /// `update` are set.
    async fn mark_wal(&self, write_id: &str, update: WalUpdate) -> Result<()>;

    /// Release a WAL row's in-flight claim without otherwise changing
    /// it, so a later pass can claim it again. Used when a claimed row
    /// is left unprocessed this pass (e.g. the per-collection ordering
    /// stop after an earlier row in the same batch failed).
    async fn release_wal_claim(&self, write_id: &str) -> Result<()>;

    /// Count WAL rows grouped by status, for `/wal/status` and
    /// `/wal/stats`.
    async fn wal_status_counts(&self) -> Result<Vec<(WalStatus, i64)>>;

    /// Oldest `pending` row's timestamp, if any.
    async fn oldest_pending_wal_timestamp(&self) -> Result<Option<DateTime<Utc>>>;

    // Collection mapping --------------------------------------------------

    /// Insert or update a mapping. Existing non-null UUID slots are never
    /// overwritten with null; only a currently-null slot is filled in.
    async fn upsert_mapping(&self, mapping: &CollectionMapping) -> Result<()>;

    /// Look up a mapping by logical name.
    async fn get_mapping_by_name(&self, name: &str) -> Result<Option<CollectionMapping>>;

    /// Look up a mapping by either backend's UUID.
    async fn get_mapping_by_uuid(&self, uuid: Uuid) -> Result<Option<CollectionMapping>>;

    /// Delete a mapping by logical name.
    async fn delete_mapping(&self, name: &str) -> Result<()>;

    // Logical document IDs -------------------------------------------------

    /// Record the logical ID for a document newly observed on `backend`.
    async fn record_logical_document_id(&self, record: &LogicalDocumentId) -> Result<()>;

    /// Look up the logical ID for a backend-specific document ID.
    async fn logical_document_id(
        &self,
        collection_id: &str,
        backend: BackendName,
        backend_document_id: &str,
    ) -> Result<Option<String>>;

    // Ledger ---------------------------------------------------------------

    /// Insert a new ledger row (status `ATTEMPTING`), pre-routing.
    async fn insert_ledger(&self, txn: &LedgerTransaction) -> Result<()>;

    /// Fetch a ledger row by its transaction ID.
    async fn get_ledger(&self, transaction_id: Uuid) -> Result<Option<LedgerTransaction>>;

    /// Update a ledger row's status and associated bookkeeping fields.
    /// Also clears the row's in-flight claim, regardless of which fields
    /// in `update` are set.
    async fn update_ledger(&self, transaction_id: Uuid, update: LedgerUpdate) -> Result<()>;

    /// Release a ledger row's in-flight claim without otherwise changing
    /// it, so a later pass can claim it again. Used when a claimed row
    /// is deferred this pass (e.g. no healthy backend to replay it against).
    async fn release_ledger_claim(&self, transaction_id: Uuid) -> Result<()>;

    /// Fetch up to `limit` rows eligible for recovery:
    /// `status = FAILED`, `retry_count < max_retries`,
    /// `next_retry_at <= now`. Implementations must ensure two
    /// concurrent callers never claim the same row, on the same terms as
    /// [`StoreAdapter::claim_next_unsynced`].
    async fn fetch_recoverable_ledger(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<LedgerTransaction>>;

    /// Count ledger rows grouped by status, for
    /// `/transaction/safety/status`.
    async fn ledger_status_counts(&self) -> Result<Vec<(String, i64)>>;

    /// Count of ledger rows with `is_timing_gap_failure = true`.
    async fn ledger_timing_gap_count(&self) -> Result<i64>;

    // Retention --------------------------------------------------------------

    /// Delete terminal rows in `table` older than `retention_days`, using
    /// `time_column` as the cutoff column. This is the only deletion
    /// surface the external cleanup collaborator is allowed to drive.
    async fn cleanup(&self, table: &str, retention_days: u32, time_column: &str) -> Result<u64>;
}

/// Partial update applied to a WAL row by [`StoreAdapter::mark_wal`].
#[derive(Debug, Clone, Default)]
pub struct WalUpdate {
    /// New status, if changing.
    pub status: Option<WalStatus>,
    /// Backend the synchronous attempt executed on.
    pub executed_on: Option<BackendName>,
    /// Replace `retry_count` with this value.
    pub retry_count: Option<u32>,
    /// Replace `error_message` with this value (`Some(None)` clears it).
    pub error_message: Option<Option<String>>,
    /// Stamp `executed_at`.
    pub executed_at: Option<DateTime<Utc>>,
    /// Stamp `synced_at`.
    pub synced_at: Option<DateTime<Utc>>,
}

/// Partial update applied to a ledger row by
/// [`StoreAdapter::update_ledger`].
#[derive(Debug, Clone, Default)]
pub struct LedgerUpdate {
    /// New status, if changing.
    pub status: Option<walproxy_types::LedgerStatus>,
    /// Set `is_timing_gap_failure`.
    pub is_timing_gap_failure: Option<bool>,
    /// Replace `retry_count`.
    pub retry_count: Option<u32>,
    /// Replace `next_retry_at`.
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    /// Replace `response_status`.
    pub response_status: Option<Option<u16>>,
    /// Replace `response_data`.
    pub response_data: Option<Option<serde_json::Value>>,
    /// Replace `failure_reason`.
    pub failure_reason: Option<Option<String>>,
}

/// Parse a `TargetInstance` column value, defaulting to `Both` only when
/// this is truly unreachable (the column has a NOT NULL constraint).
pub(crate) fn parse_target_instance(s: &str) -> TargetInstance {
    s.parse().unwrap_or(TargetInstance::Both)
}
