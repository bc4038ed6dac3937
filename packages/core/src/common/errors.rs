//! Application-wide error taxonomy.
//!
//! Every fallible operation in the scheduling and delivery pipeline resolves
//! to one of these variants so callers can decide whether to retry, log and
//! drop, or escalate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient external error: {0}")]
    TransientExternal(String),

    #[error("permanent external error: {0}")]
    PermanentExternal(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    /// Whether retrying the operation that produced this error is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::TransientExternal(_) | AppError::Database(_))
    }
}

impl From<vendor_client::VendorError> for AppError {
    fn from(err: vendor_client::VendorError) -> Self {
        if err.is_transient() {
            AppError::TransientExternal(err.to_string())
        } else {
            AppError::PermanentExternal(err.to_string())
        }
    }
}
