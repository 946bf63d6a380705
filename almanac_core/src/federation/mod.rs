//! Inbound federation: events pushed by registered peer nodes.
//!
//! Payloads are parsed into a typed [`payload::FederatedEvent`] at the
//! boundary. The sync path then matches on federation URI, shares
//! place/organization resolution with direct ingestion and runs under the
//! same idempotency coordinator.

mod error;
pub mod nodes;
pub mod payload;
pub mod sync;

pub use error::{Error, Result};
pub use nodes::{NodeRegistration, NodeRegistry};
pub use payload::{EntityRef, FederatedEvent};
pub use sync::{FederationSync, SyncResult};
