//! Application-level errors (wraps domain errors)

use thiserror::Error;

use crate::domain::DomainError;

/// Application errors wrap domain errors and add locking and configuration context.
#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("{0}")]
    Domain(#[from] DomainError),

    #[error("lock contention on routing domain {domain_id}, retry later")]
    Contention { domain_id: String },

    #[error("config error: {message}")]
    Config { message: String },
}

impl ApplicationError {
    /// Contention is transient; everything else is a rejected request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplicationError::Contention { .. })
    }
}

/// Result type for application layer operations.
pub type ApplicationResult<T> = Result<T, ApplicationError>;
