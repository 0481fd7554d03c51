use thiserror::Error;

use crate::{cache::CacheError, db::DbError};

/// Error taxonomy for the plan accounting core.
///
/// Validation errors are returned to the caller unchanged. Infrastructure
/// faults surface as `StoreUnavailable` and are never folded into
/// `QuotaExceeded`. `Internal` is reserved for genuinely unexpected states
/// and is always paired with an error-level log at the emission site.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Quota exceeded (assignment={assignment_id}, metric={metric}, remaining={remaining}, needed={needed})")]
    QuotaExceeded {
        assignment_id: i64,
        metric: String,
        remaining: i64,
        needed: i64,
    },

    #[error("Ineligible: {0}")]
    Ineligible(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] DbError),

    #[error("Operation cancelled: deadline expired")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DbError> for CoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => CoreError::NotFound("record not found".to_string()),
            DbError::Conflict(msg) => CoreError::Conflict(msg),
            DbError::Validation(msg) => CoreError::InvalidArgument(msg),
            DbError::Internal(msg) => CoreError::Internal(msg),
            other => CoreError::StoreUnavailable(other),
        }
    }
}

impl From<CacheError> for CoreError {
    fn from(err: CacheError) -> Self {
        // The cache is a correctness-neutral accelerator; a cache fault is
        // never fatal to the caller, but if one is propagated this far it is
        // an unexpected state.
        CoreError::Internal(format!("cache error: {err}"))
    }
}

impl From<validator::ValidationErrors> for CoreError {
    fn from(err: validator::ValidationErrors) -> Self {
        CoreError::InvalidArgument(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
