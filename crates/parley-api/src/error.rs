use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use parley_db::DbError;
use parley_types::models::ValidationError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad or oversized input; never retried.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    BadRequest(String),

    #[error("not authenticated")]
    Unauthenticated,

    /// Caller is not a participant; a hard failure.
    #[error("not a participant in this conversation")]
    Forbidden,

    #[error("not found")]
    NotFound,

    /// Persistent write contention after retries; the client may retry.
    #[error("temporarily unavailable, retry")]
    Unavailable,

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(e) if e.is_oversized() => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Validation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Validation(e) => Self::Validation(e),
            DbError::NotParticipant => Self::Forbidden,
            DbError::Conflict(e) => {
                warn!("write conflict survived retries: {}", e);
                Self::Unavailable
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Self::Internal(detail) = &self {
            // Detail stays in the log; the caller sees a generic message.
            error!("internal error: {}", detail);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
