use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::candidate::ValidationError;
use crate::{catalog, idempotency};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The candidate is malformed. Nothing was persisted.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// A concurrent writer won a unique constraint and the winner could
    /// not be resolved as a duplicate.
    #[error("conflicting write: {constraint}")]
    Conflict { constraint: String },

    /// The same content was rejected by a moderator and has not changed.
    #[error("previously rejected by {reviewer} at {reviewed_at}: {reason}")]
    PreviouslyRejected {
        entry_id: String,
        reviewer: String,
        reviewed_at: DateTime<Utc>,
        reason: String,
    },

    #[error("batch is empty")]
    BatchEmpty,

    #[error("batch has {size} items; the limit is {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    /// Every queue slot is taken; retry later.
    #[error("batch queue is full")]
    QueueFull,

    #[error("batch queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Idempotency(#[from] idempotency::Error),

    #[error(transparent)]
    Store(#[from] catalog::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::QueueFull | Self::QueueClosed => true,
            Self::Idempotency(e) => e.is_transient(),
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Self::Validation {
            field: err.field,
            message: err.message,
        }
    }
}
