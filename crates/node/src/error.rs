//! Client-facing error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use concord_data::StoreError;
use concord_types::NodeId;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to clients.
///
/// The kinds map onto HTTP classes: TRANSIENT → 503, CONFLICT → 409,
/// NOT_FOUND → 404. Invariant violations are not represented here: they
/// are fatal and stop the driver rather than travel back to a client.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Peer unreachable, timed out, or quorum not yet formed. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// No leader is known; retry against another node or later.
    #[error("no leader elected yet")]
    NoLeader { hint: Option<NodeId> },

    /// Deadlock refused, digest mismatch, or another conflicting operation.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        NodeError::Transient(err.to_string())
    }
}

/// Generic error response body.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<NodeId>,
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let (status, leader) = match &self {
            NodeError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, None),
            NodeError::NoLeader { hint } => (StatusCode::SERVICE_UNAVAILABLE, hint.clone()),
            NodeError::Conflict(_) => (StatusCode::CONFLICT, None),
            NodeError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            NodeError::BadRequest(_) => (StatusCode::BAD_REQUEST, None),
        };
        let body = ErrorResponse {
            error: self.to_string(),
            leader,
        };
        (status, Json(body)).into_response()
    }
}
