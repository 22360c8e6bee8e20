//! The typed error surface for the whole node.
//!
//! Every fallible operation in the delegation router, the supervisor and
//! the settlement adapter returns `Result<_, ApiError>` (or narrows to a
//! specific variant at the call site). `IntoResponse` turns a variant into
//! exactly the `{error_code, error, ...}` envelope the tree has always
//! spoken on the wire, so a child's 409 still looks like a 409 to whatever
//! forwarded it.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use observer_protocol::ErrorBody;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("stream not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("all observers are busy")]
    Busy,

    #[error("gametype not supported")]
    Unsupported,

    #[error("{0}")]
    BadRequest(String),

    #[error("forbidden")]
    Forbidden,

    #[error("downstream request failed: {status}")]
    Downstream {
        status: StatusCode,
        body: serde_json::Value,
    },

    #[error("peer request error: {0}")]
    PeerUnreachable(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Busy => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::Unsupported => StatusCode::BAD_REQUEST,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Downstream { status, .. } => *status,
            ApiError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let details = match &self {
            ApiError::Downstream { body, .. } => Some(json!({ "details": body })),
            _ => None,
        };
        let body = ErrorBody {
            error_code: status.as_u16(),
            error: self.to_string(),
            details,
        };
        (status, Json(body)).into_response()
    }
}
