//! Persistence boundary. Everything the core stores goes through
//! [`CatalogStore`] / [`CatalogTx`]; storage uniqueness is the mutual
//! exclusion primitive for concurrent submissions.

mod error;
pub mod identity;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod traits;

pub use error::{Error, Result};
pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;
pub use traits::{CatalogStore, CatalogTx};
