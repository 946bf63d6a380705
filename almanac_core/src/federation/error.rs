use thiserror::Error;

use crate::{catalog, idempotency};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Not a JSON object, empty, or missing `@context`.
    #[error("invalid federation payload: {0}")]
    InvalidPayload(String),

    #[error("missing or invalid @id")]
    MissingId,

    #[error("missing @type")]
    MissingType,

    #[error("unsupported @type: {0}")]
    UnsupportedType(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("invalid date format in {0} (expected RFC 3339)")]
    InvalidDateFormat(String),

    #[error("unknown federation node: {0}")]
    UnknownNode(String),

    #[error("sync is disabled for node {0}")]
    NodeSyncDisabled(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflicting write: {constraint}")]
    Conflict { constraint: String },

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
            Self::Conflict { .. } => true,
            Self::Idempotency(e) => e.is_transient(),
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
