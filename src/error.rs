use thiserror::Error;

/// Core error type for the session store.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Empty identifiers, reserved-prefix state keys, unknown options.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Session missing on append/update, unknown key.
    #[error("not found: {0}")]
    NotFound(String),

    /// `CreateSession` called against a still-live session.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Schema verification found a missing column or wrong type; fatal at init.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Driver-level I/O failure; callers may retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Marshaling failure, unexpected driver response, recovered worker panic.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SessionError::NotFound(err.to_string()),
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                SessionError::StorageUnavailable(err.to_string())
            }
            other => SessionError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Internal(format!("json marshaling failed: {err}"))
    }
}

impl SessionError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        SessionError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SessionError::NotFound(msg.into())
    }
}
