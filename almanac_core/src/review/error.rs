use thiserror::Error;

use crate::catalog;
use crate::catalog::models::ReviewStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("review entry not found: {0}")]
    NotFound(String),

    /// Lost the race to another moderator, or a repeated submit.
    #[error("already reviewed (status: {status})")]
    AlreadyReviewed { status: ReviewStatus },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The entry points at an event that no longer exists.
    #[error("event {0} referenced by review entry is missing")]
    EventMissing(String),

    #[error(transparent)]
    Store(#[from] catalog::Error),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
