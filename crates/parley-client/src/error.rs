use reqwest::StatusCode;
use thiserror::Error;

use parley_types::models::ValidationError;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Rejected locally before any network call.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The server refused the request as malformed; resending won't help.
    #[error("rejected by server ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Network hiccup, contention or server fault. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Missing, expired or forged credentials, or a participant check
    /// failed. Fatal for the session.
    #[error("not authorized: {0}")]
    Authorization(String),

    /// The server sent something this client cannot understand.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Authorization(message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Self::Transient(message),
            s if s.is_server_error() => Self::Transient(message),
            s => Self::Rejected {
                status: s.as_u16(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status, err.to_string());
        }
        if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => {
                let status = response.status();
                Self::from_status(
                    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
                    format!("gateway upgrade refused: {}", status),
                )
            }
            WsError::Url(e) => Self::Protocol(e.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
