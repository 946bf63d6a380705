//! Ingestion, moderation and federation sync for a shared event catalog.
//!
//! Submissions arrive from direct clients, scrapers and peer nodes. Every
//! entry point goes through the same dedup and idempotency machinery and
//! persists through the [`catalog::CatalogStore`] trait.

pub mod candidate;
pub mod catalog;
pub mod config;
pub mod dedup;
pub mod error;
pub mod federation;
pub mod idempotency;
pub mod ingest;
pub mod lifecycle;
pub mod models;
pub mod o11y;
pub mod retention;
pub mod review;

pub use error::{Error, Result};
