use thiserror::Error;

use crate::catalog;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Another request holds the token and did not finish in time.
    #[error("idempotency key {key} is in flight")]
    InFlight { key: String },

    #[error("idempotency key {key} was already used with a different payload")]
    PayloadMismatch { key: String },

    #[error(transparent)]
    Store(#[from] catalog::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InFlight { .. } => true,
            Self::PayloadMismatch { .. } | Self::Serde(_) => false,
            Self::Store(e) => e.is_transient(),
        }
    }
}
