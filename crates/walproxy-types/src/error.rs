//! Error kinds shared across the WAL replication proxy.
//!
//! These are kinds, not exhaustive error types per crate: each layer maps
//! its own failure modes (a `reqwest` timeout, a `sqlx` constraint
//! violation) onto one of these variants so the router, ledger, and WAL
//! engine can all make decisions from the same vocabulary.

use uuid::Uuid;

/// Errors that can occur anywhere in the proxy's request or background
/// worker paths.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection-level failure or deadline exceeded talking to a backend.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A live backend returned a 4xx/5xx response.
    #[error("backend rejected request ({status}): {body}")]
    BackendRejected {
        /// HTTP status code returned by the backend.
        status: u16,
        /// Response body, truncated for logging.
        body: String,
    },

    /// The relational store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store operation exceeded its deadline.
    #[error("store operation timed out")]
    StoreTimeout,

    /// No mapping exists for the requested collection identifier.
    #[error("no collection mapping for identifier: {0}")]
    MappingMissing(String),

    /// Two different logical names claim the same backend UUID.
    #[error("mapping conflict: {0}")]
    MappingConflict(String),

    /// A WAL replay required a logical document ID that was not on file.
    #[error("deletion-form conversion impossible: {0}")]
    DeletionConversionImpossible(String),

    /// `BackendUnavailable` raised against a backend the prober still
    /// considers healthy — the timing-gap case.
    #[error("timing-gap failure against backend believed healthy: {0}")]
    TimingGapFailure(String),

    /// Neither backend is currently healthy.
    #[error("no backend available")]
    NoBackendAvailable,

    /// Malformed or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wrapped `sqlx` error, for conversion into the kinds above at the
    /// call site via `map_store_err`.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// Wrapped `reqwest` error, for conversion into the kinds above at
    /// the call site via `map_backend_err`.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

impl Error {
    /// Classify a raw `sqlx::Error` into the store-facing kinds used by
    /// the synchronous write path, which surfaces store failures to the
    /// client as a 503.
    pub fn from_store(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Error::StoreTimeout,
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                Error::StoreUnavailable(err.to_string())
            }
            other => Error::StoreUnavailable(other.to_string()),
        }
    }

    /// Classify a raw `reqwest::Error` into the backend-facing kinds.
    pub fn from_backend(err: reqwest::Error) -> Self {
        Error::BackendUnavailable(err.to_string())
    }

    /// The error kind name used in the client-visible JSON envelope
    /// (`{ "error": <kind>, ... }`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::BackendUnavailable(_) => "BackendUnavailable",
            Error::BackendRejected { .. } => "BackendRejected",
            Error::StoreUnavailable(_) => "StoreUnavailable",
            Error::StoreTimeout => "StoreTimeout",
            Error::MappingMissing(_) => "MappingMissing",
            Error::MappingConflict(_) => "MappingConflict",
            Error::DeletionConversionImpossible(_) => "DeletionConversionImpossible",
            Error::TimingGapFailure(_) => "TimingGapFailure",
            Error::NoBackendAvailable => "NoBackendAvailable",
            Error::Config(_) => "ConfigError",
            Error::Sqlx(_) => "StoreUnavailable",
            Error::Reqwest(_) => "BackendUnavailable",
        }
    }

    /// Whether this error should surface to the client as a 503 carrying
    /// a `Transaction-ID`.
    pub fn is_client_facing_503(&self) -> bool {
        !matches!(self, Error::BackendRejected { .. } | Error::MappingConflict(_))
    }
}

/// The JSON body returned to clients on a fatal write failure:
/// `{ "error": <kind>, "transaction_id": <id>,
/// "retry_after_seconds": <seconds> }`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorEnvelope {
    /// The error kind name.
    pub error: String,
    /// The ledger transaction ID the client can poll recovery with.
    pub transaction_id: Uuid,
    /// Suggested retry delay in seconds.
    pub retry_after_seconds: u64,
}

impl ErrorEnvelope {
    /// Build an envelope from an error and the transaction it was logged
    /// under.
    pub fn new(err: &Error, transaction_id: Uuid, retry_after_seconds: u64) -> Self {
        Self {
            error: err.kind_name().to_string(),
            transaction_id,
            retry_after_seconds,
        }
    }
}
