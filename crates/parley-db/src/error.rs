use parley_types::models::ValidationError;
use rusqlite::{ErrorCode, ffi};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),

    /// Busy writer or a colliding insert; the caller may retry.
    #[error("write conflict: {0}")]
    Conflict(rusqlite::Error),

    #[error("user is not a participant in this conversation")]
    NotParticipant,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("DB lock poisoned: {0}")]
    Poisoned(String),
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        let retryable = match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => true,
                ErrorCode::ConstraintViolation => matches!(
                    e.extended_code,
                    ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE
                ),
                _ => false,
            },
            _ => false,
        };

        if retryable {
            Self::Conflict(err)
        } else {
            Self::Sqlite(err)
        }
    }
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, DbError>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, DbError> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
