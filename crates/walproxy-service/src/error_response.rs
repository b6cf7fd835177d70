//! Converts a leaf [`walproxy_types::Error`] into the client-facing 503
//! JSON envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use walproxy_types::{Error, ErrorEnvelope};

/// Build the client-facing error response for a fatal write failure,
/// tagged with the ledger transaction the client can poll recovery
/// with.
pub fn error_response(err: &Error, transaction_id: Uuid) -> Response {
    let status = match err {
        Error::BackendRejected { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        Error::MappingConflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    let retry_after_seconds = match err {
        Error::NoBackendAvailable => 30,
        Error::StoreUnavailable(_) | Error::StoreTimeout => 10,
        _ => 5,
    };
    let envelope = ErrorEnvelope::new(err, transaction_id, retry_after_seconds);
    (status, Json(envelope)).into_response()
}
