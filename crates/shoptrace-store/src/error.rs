use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The event log already holds a row for this (session, step) pair.
    #[error("duplicate step {step_number} for session {session_id}")]
    DuplicateStep {
        session_id: String,
        step_number: i64,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn duplicate_step(session_id: impl Into<String>, step_number: i64) -> Self {
        Self::DuplicateStep {
            session_id: session_id.into(),
            step_number,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn invalid_cursor(message: impl Into<String>) -> Self {
        Self::InvalidCursor(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// True when the write was rejected because the step was already logged,
    /// which callers may acknowledge as a re-delivery.
    pub fn is_duplicate_step(&self) -> bool {
        matches!(self, Self::DuplicateStep { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
