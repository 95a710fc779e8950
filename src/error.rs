//! Error taxonomy for the broker.
//!
//! Per spec, no error ever reaches an NT4 peer as a wire message. These
//! variants cover the Protocol-violation/Authorization/Consistency
//! categories, which are always handled by dropping the offending frame and
//! logging a warning. Transport errors and outbound queue overflow (the
//! Resource-exhaustion category) don't round-trip through this enum — they
//! close the connection directly (`api::websocket::handle_socket`,
//! `Broker::close_overflowing`) since there's no caller left to hand a
//! `Result` back to once the connection is gone. `ApiError` is the thin
//! subset that escapes to the handful of plain HTTP endpoints (`/health`,
//! `/stats`) and implements `IntoResponse` there.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Errors raised by broker-internal operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("topic '{name}' already exists with type '{existing}', rejected publish of type '{attempted}'")]
    TypeMismatch {
        name: String,
        existing: String,
        attempted: String,
    },

    #[error("connection holds no publication bound to topic id {0}")]
    UnauthorizedValue(u32),

    #[error("unpublish for unknown pubuid {0}")]
    UnknownPubuid(i64),

    #[error("setproperties for unknown topic '{0}'")]
    UnknownTopic(String),
}

/// Errors surfaced by the plain HTTP surface (not the NT4 wire protocol).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no compatible NT4 subprotocol offered")]
    SubprotocolRejected,

    #[error("connection limit reached")]
    TooManyConnections,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::SubprotocolRejected => StatusCode::BAD_REQUEST,
            ApiError::TooManyConnections => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
