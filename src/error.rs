//! Error types for core operations
//!
//! Errors are classified by how the caller should react:
//! - Retryable: transient storage failures (busy/locked database, timeouts)
//! - Caller error: invalid arguments, not found, integrity violations
//! - Critical: attempted mutation of the audit ledger

use thiserror::Error;

use crate::db::DbError;

/// Error types surfaced by the service facade.
#[derive(Debug, Error)]
pub enum CoreError {
    // Caller errors, never retried
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing and foreign-workspace entities are deliberately indistinguishable.
    #[error("Not found")]
    NotFound,

    #[error("Integrity violation: {0}")]
    Integrity(String),

    // Retryable errors
    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Operation exceeded its deadline")]
    Timeout,

    // Critical
    #[error("Audit ledger immutability violation: {0}")]
    ImmutabilityViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns true if the operation may succeed when attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Storage(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CoreError::NotFound => ErrorKind::NotFound,
            CoreError::Integrity(_) => ErrorKind::Integrity,
            CoreError::Storage(_) | CoreError::Timeout => ErrorKind::Unavailable,
            CoreError::ImmutabilityViolation(_) | CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to show to an end user for a failed read.
    ///
    /// Validation failures keep their reason; everything storage-side collapses
    /// to a generic message naming only what was being fetched.
    pub fn user_message(&self, fetching: &str) -> String {
        match self {
            CoreError::InvalidArgument(reason) => reason.clone(),
            CoreError::NotFound => "Not found".to_string(),
            _ => format!("Failed to fetch {}", fetching),
        }
    }
}

impl From<DbError> for CoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Integrity(detail) => CoreError::Integrity(detail),
            DbError::ImmutableLedger(detail) => {
                log::error!("CRITICAL: attempted mutation of audit ledger: {}", detail);
                CoreError::ImmutabilityViolation(detail)
            }
            DbError::Busy(detail) => CoreError::Storage(detail),
            DbError::InvalidData(detail) => CoreError::Internal(detail),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

/// Serializable error representation for the route layer
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub message: String,
    pub kind: ErrorKind,
    pub can_retry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Integrity,
    Unavailable,
    Internal,
}

impl ApiError {
    pub fn from_core(err: &CoreError, fetching: &str) -> Self {
        ApiError {
            message: err.user_message(fetching),
            kind: err.kind(),
            can_retry: err.is_retryable() || matches!(err, CoreError::Timeout),
        }
    }
}
