use std::time::Duration;

use thiserror::Error;

use crate::{dao::storage::StoreError, social::SocialError};

/// Errors that abort a single lifecycle tick. They never stop the process.
#[derive(Debug, Error)]
pub enum TickError {
    /// The game store failed or refused the transition.
    #[error("game store: {0}")]
    Store(#[from] StoreError),
    /// The social platform failed after retries.
    #[error("social platform: {0}")]
    Social(#[from] SocialError),
    /// A single external call exceeded the I/O budget.
    #[error("`{operation}` timed out after {limit:?}")]
    Timeout {
        /// Name of the call.
        operation: &'static str,
        /// Budget that elapsed.
        limit: Duration,
    },
}

impl TickError {
    /// Whether repeating the failed call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TickError::Store(err) => err.is_transient(),
            TickError::Social(err) => err.is_retryable(),
            TickError::Timeout { .. } => true,
        }
    }

    /// How long the platform asked us to wait before trying again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TickError::Social(SocialError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        }
    }

    /// Whether the store refused a transition because another actor won.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TickError::Store(StoreError::Conflict { .. }))
    }
}
