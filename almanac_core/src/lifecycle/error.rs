use thiserror::Error;

use crate::catalog;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Deleted events are read-only; only their tombstone remains public.
    #[error("event {0} is deleted")]
    EventDeleted(String),

    #[error("cannot merge an event into itself")]
    CannotMergeSameEvent,

    /// The edit would collide with another live event.
    #[error("conflicting write: {constraint}")]
    Conflict { constraint: String },

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
