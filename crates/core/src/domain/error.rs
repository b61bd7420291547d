// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Invalid batch status transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unknown batch status: {0}")]
    InvalidStatus(String),

    #[error(
        "Count invariant violated: success {success} + error {error} > activity count {activity_count}"
    )]
    CountInvariant {
        success: i64,
        error: i64,
        activity_count: i64,
    },

    #[error("Retry budget exhausted: {retry_count}/{max_retries}")]
    RetryExhausted { retry_count: i64, max_retries: i64 },

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
