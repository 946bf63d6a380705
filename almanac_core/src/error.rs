use std::error::Error as StdError;

/// Common error type for `almanac_core`.
///
/// Component services return their own closed error enums; this type wraps
/// them for callers (the CLI, embedding servers) that only need one.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Catalog(#[from] crate::catalog::Error),

    #[error(transparent)]
    Idempotency(#[from] crate::idempotency::Error),

    #[error(transparent)]
    Ingest(#[from] crate::ingest::Error),

    #[error(transparent)]
    Review(#[from] crate::review::Error),

    #[error(transparent)]
    Federation(#[from] crate::federation::Error),

    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::Error),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
}

impl Error {
    #[tracing::instrument(level = "debug", name = "almanac.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether retrying the same request (with the same idempotency token)
    /// may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InvalidInput(_) => false,
            Self::Catalog(e) => e.is_transient(),
            Self::Idempotency(e) => e.is_transient(),
            Self::Ingest(e) => e.is_transient(),
            Self::Review(e) => e.is_transient(),
            Self::Federation(e) => e.is_transient(),
            Self::Lifecycle(e) => e.is_transient(),
            Self::Backend { .. } => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
