use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".into()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };

        (
            status,
            Json(ErrorBody {
                success: false,
                error: message,
            }),
        )
            .into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Internal(e.into())
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::UnknownRelay(_) => AppError::NotFound(e.to_string()),
            EngineError::AlreadyRunning(_) | EngineError::InvalidTransition { .. } => {
                AppError::Conflict(e.to_string())
            }
            EngineError::LeaderMismatch { .. }
            | EngineError::ForeignLink { .. }
            | EngineError::SelfFollow(_) => AppError::BadRequest(e.to_string()),
        }
    }
}

/// Category of a surfaced relay failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection dropped or could not be opened; retried with backoff.
    TransportError,
    /// Credentials or signature rejected.
    AuthError,
    /// Leader record could not be turned into a signal.
    MalformedSignal,
    /// Sizing or risk policy refused the mirror.
    SizingRejected,
    /// Order placement failed after all retries.
    OrderPlacementError,
    /// Reconnect budget spent; needs an operator restart.
    ConnectionExhausted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::TransportError => "transport_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::MalformedSignal => "malformed_signal",
            ErrorKind::SizingRejected => "sizing_rejected",
            ErrorKind::OrderPlacementError => "order_placement_error",
            ErrorKind::ConnectionExhausted => "connection_exhausted",
        };
        f.write_str(s)
    }
}
