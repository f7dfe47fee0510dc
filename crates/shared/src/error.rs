//! Error types for chatrelay

use thiserror::Error;

/// Failure taxonomy for the relay core.
///
/// Failures stay contained to the session/operation that raised them;
/// one connection's error never tears down other connections in the room.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Not authorized for room: {0}")]
    Unauthorized(String),

    #[error("Room does not exist")]
    RoomNotFound,

    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RelayError::RoomNotFound,
            other => RelayError::Store(other.to_string()),
        }
    }
}
