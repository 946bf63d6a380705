//! Direct submissions: validation, dedup routing and persistence, plus the
//! asynchronous batch variant.

mod error;

pub mod batch;
pub mod service;

pub use batch::{BatchIngestor, BatchIngestorHandle};
pub use error::{Error, Result};
pub use service::{IngestOptions, IngestResult, IngestService};
