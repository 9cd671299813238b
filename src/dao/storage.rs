use std::error::Error;
use thiserror::Error;
use uuid::Uuid;

/// Result alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by storage backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrent transition won the race (e.g. another game is already open).
    #[error("conflicting state transition: {message}")]
    Conflict { message: String },
    /// The referenced game (or entry) does not exist or is not in the expected state.
    #[error("game `{game_id}` not found: {message}")]
    NotFound { game_id: Uuid, message: String },
    /// Backend could not be reached or rejected the request.
    #[error("storage unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl StoreError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StoreError::Unavailable {
            message,
            source: Box::new(source),
        }
    }

    /// Construct a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        StoreError::Conflict {
            message: message.into(),
        }
    }

    /// Construct a not-found error for `game_id`.
    pub fn not_found(game_id: Uuid, message: impl Into<String>) -> Self {
        StoreError::NotFound {
            game_id,
            message: message.into(),
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}
