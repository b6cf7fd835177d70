#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **walproxy-types** – Shared primitive data structures for the WAL
//! replication proxy.
//!
//! The crate is dependency-light (beyond `serde`/`sqlx`/`reqwest` error
//! conversions) and sits at the bottom of the crate graph so every other
//! crate can depend on it without causing cycles. It makes no assumptions
//! about routing policy, storage engine choice, or HTTP framework.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub use error::Error;

/// Convenience result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

//─────────────────────────────
//  Backend identity
//─────────────────────────────

/// Which downstream database instance a row, pin, or routing decision
/// refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendName {
    /// The primary backend.
    Primary,
    /// The replica backend.
    Replica,
}

impl BackendName {
    /// The backend name's short string form, as used in log fields and
    /// store columns.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendName::Primary => "primary",
            BackendName::Replica => "replica",
        }
    }

    /// The other backend.
    pub fn other(&self) -> BackendName {
        match self {
            BackendName::Primary => BackendName::Replica,
            BackendName::Replica => BackendName::Primary,
        }
    }
}

impl fmt::Display for BackendName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BackendName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(BackendName::Primary),
            "replica" => Ok(BackendName::Replica),
            other => Err(Error::Config(format!("unknown backend name: {other}"))),
        }
    }
}

/// An addressable database instance, created at startup from
/// configuration and mutated only by the Health Prober.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    /// Stable short name (`primary` or `replica`).
    pub name: BackendName,
    /// Base URL of the backend's HTTP API.
    pub base_url: String,
    /// Routing priority; lower is preferred.
    pub priority: u8,
    /// Whether the Health Prober currently considers this backend live.
    pub healthy: bool,
    /// Rolling count of consecutive probe successes.
    pub consecutive_successes: u32,
    /// Rolling count of consecutive probe failures.
    pub consecutive_failures: u32,
    /// Timestamp of the last probe attempt.
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Timestamp the health flag last flipped.
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl Backend {
    /// Construct a new backend entry, initially assumed healthy so the
    /// router can route to it before the first probe completes.
    pub fn new(name: BackendName, base_url: impl Into<String>, priority: u8) -> Self {
        Self {
            name,
            base_url: base_url.into(),
            priority,
            healthy: true,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_probe_at: None,
            last_transition_at: None,
        }
    }
}

//─────────────────────────────
//  Target instance
//─────────────────────────────

/// Which backend(s) a WAL entry must end up applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetInstance {
    /// Only the primary backend.
    Primary,
    /// Only the replica backend.
    Replica,
    /// Both backends.
    Both,
}

impl TargetInstance {
    /// Whether this target includes the given backend.
    pub fn includes(&self, backend: BackendName) -> bool {
        match self {
            TargetInstance::Both => true,
            TargetInstance::Primary => backend == BackendName::Primary,
            TargetInstance::Replica => backend == BackendName::Replica,
        }
    }

    /// String form as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetInstance::Primary => "primary",
            TargetInstance::Replica => "replica",
            TargetInstance::Both => "both",
        }
    }
}

impl std::str::FromStr for TargetInstance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(TargetInstance::Primary),
            "replica" => Ok(TargetInstance::Replica),
            "both" => Ok(TargetInstance::Both),
            other => Err(Error::Config(format!("unknown target_instance: {other}"))),
        }
    }
}

//─────────────────────────────
//  Collection identity
//─────────────────────────────

/// Logical identity of a collection, bridging the UUID each backend
/// assigns independently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionMapping {
    /// Globally unique, case-sensitive logical name.
    pub name: String,
    /// UUID assigned by the primary backend, if materialized there.
    pub primary_uuid: Option<Uuid>,
    /// UUID assigned by the replica backend, if materialized there.
    pub replica_uuid: Option<Uuid>,
    /// Opaque configuration JSON captured at creation time.
    pub configuration: serde_json::Value,
    /// When the mapping was first created.
    pub created_at: DateTime<Utc>,
    /// When the mapping was last updated.
    pub updated_at: DateTime<Utc>,
}

impl CollectionMapping {
    /// The UUID this mapping has on the given backend, if materialized.
    pub fn uuid_for(&self, backend: BackendName) -> Option<Uuid> {
        match backend {
            BackendName::Primary => self.primary_uuid,
            BackendName::Replica => self.replica_uuid,
        }
    }

    /// Whether the mapping is fully materialized on both backends.
    pub fn is_complete(&self) -> bool {
        self.primary_uuid.is_some() && self.replica_uuid.is_some()
    }
}

//─────────────────────────────
//  WAL entry
//─────────────────────────────

/// Lifecycle status of a `WalEntry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalStatus {
    /// Inserted, not yet confirmed on any backend.
    Pending,
    /// Confirmed on the backend chosen for the synchronous attempt.
    Executed,
    /// Confirmed on both backends; terminal.
    Synced,
    /// Exceeded `retry_count >= max_retries`; terminal.
    Failed,
}

impl WalStatus {
    /// Whether this status is terminal (no further transitions expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, WalStatus::Synced | WalStatus::Failed)
    }

    /// String form as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            WalStatus::Pending => "pending",
            WalStatus::Executed => "executed",
            WalStatus::Synced => "synced",
            WalStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for WalStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WalStatus::Pending),
            "executed" => Ok(WalStatus::Executed),
            "synced" => Ok(WalStatus::Synced),
            "failed" => Ok(WalStatus::Failed),
            other => Err(Error::Config(format!("unknown wal status: {other}"))),
        }
    }
}

/// A durable write operation awaiting propagation to both backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Opaque unique identifier supplied by the proxy frontend.
    pub write_id: String,
    /// Monotonic insertion sequence, used as the tie-break for
    /// equal-timestamp ordering within a collection.
    pub sequence: i64,
    /// Original HTTP method.
    pub method: String,
    /// Original HTTP path, already UUID-rewritten for `executed_on`.
    pub path: String,
    /// Request body bytes.
    pub body: Vec<u8>,
    /// Subset of request headers relevant to replay (content-type,
    /// auth), as `(name, value)` pairs.
    pub headers: Vec<(String, String)>,
    /// Which backend(s) must end up having this write applied.
    pub target_instance: TargetInstance,
    /// Where the synchronous attempt ran, if it ran at all.
    pub executed_on: Option<BackendName>,
    /// Current lifecycle status.
    pub status: WalStatus,
    /// Collection this write targets, for indexed lookup and per-collection
    /// FIFO ordering.
    pub collection_id: Option<String>,
    /// Number of replay attempts so far.
    pub retry_count: u32,
    /// Most recent error message, if any attempt failed.
    pub error_message: Option<String>,
    /// When the row was inserted.
    pub timestamp: DateTime<Utc>,
    /// When the synchronous attempt succeeded.
    pub executed_at: Option<DateTime<Utc>>,
    /// When the row reached `synced`.
    pub synced_at: Option<DateTime<Utc>>,
}

//─────────────────────────────
//  Ledger transaction
//─────────────────────────────

/// Lifecycle status of a `LedgerTransaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Logged before routing; in flight.
    Attempting,
    /// Synchronous attempt succeeded.
    Completed,
    /// Synchronous attempt failed and is eligible for recovery.
    Failed,
    /// A previously failed transaction was replayed successfully.
    Recovered,
    /// Retries exhausted without success.
    Abandoned,
}

impl LedgerStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LedgerStatus::Completed | LedgerStatus::Recovered | LedgerStatus::Abandoned
        )
    }

    /// String form as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Attempting => "ATTEMPTING",
            LedgerStatus::Completed => "COMPLETED",
            LedgerStatus::Failed => "FAILED",
            LedgerStatus::Recovered => "RECOVERED",
            LedgerStatus::Abandoned => "ABANDONED",
        }
    }
}

impl std::str::FromStr for LedgerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ATTEMPTING" => Ok(LedgerStatus::Attempting),
            "COMPLETED" => Ok(LedgerStatus::Completed),
            "FAILED" => Ok(LedgerStatus::Failed),
            "RECOVERED" => Ok(LedgerStatus::Recovered),
            "ABANDONED" => Ok(LedgerStatus::Abandoned),
            other => Err(Error::Config(format!("unknown ledger status: {other}"))),
        }
    }
}

/// The pre-routing safety record for a single client write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Unique transaction identifier, handed back to clients on failure.
    pub transaction_id: Uuid,
    /// Original HTTP method.
    pub method: String,
    /// Original HTTP path (pre-rewrite).
    pub path: String,
    /// Request body, decoded as JSON when possible.
    pub data: Option<serde_json::Value>,
    /// Subset of request headers.
    pub headers: Vec<(String, String)>,
    /// Current lifecycle status.
    pub status: LedgerStatus,
    /// True when the failure indicates the chosen backend was actually
    /// unhealthy despite a cached-healthy verdict.
    pub is_timing_gap_failure: bool,
    /// Number of recovery attempts so far.
    pub retry_count: u32,
    /// Maximum recovery attempts before `ABANDONED`.
    pub max_retries: u32,
    /// Earliest time the recovery worker may retry this row.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Which backend(s) this write must reach.
    pub target_instance: TargetInstance,
    /// Opaque client session identifier, if supplied.
    pub client_session: Option<String>,
    /// Client IP address, for forensic purposes.
    pub client_ip: Option<String>,
    /// Coarse operation classification (e.g. `create_collection`).
    pub operation_type: String,
    /// HTTP status of the synchronous response, if one was produced.
    pub response_status: Option<u16>,
    /// Response payload captured on completion.
    pub response_data: Option<serde_json::Value>,
    /// Human-readable failure reason.
    pub failure_reason: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row last changed status.
    pub updated_at: DateTime<Utc>,
}

impl LedgerTransaction {
    /// Default maximum recovery attempts per spec.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Compute the exponential backoff delay for the given retry count:
    /// `60 * 2^retry_count` seconds.
    pub fn backoff_for(retry_count: u32) -> chrono::Duration {
        let secs = 60i64.saturating_mul(1i64 << retry_count.min(20));
        chrono::Duration::seconds(secs)
    }

    /// Whether this row is currently eligible for recovery.
    pub fn is_recoverable(&self, now: DateTime<Utc>) -> bool {
        self.status == LedgerStatus::Failed
            && self.retry_count < self.max_retries
            && self.next_retry_at.map(|t| t <= now).unwrap_or(true)
    }
}
