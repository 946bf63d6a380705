use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::catalog;

/// Who is calling into the core. Supplied by the (external) auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    /// A human moderator or admin.
    Moderator { id: String },
    /// A direct API client or scraper, identified by its source key.
    Client { source: String },
    /// A peer federation node.
    Peer { domain: String },
    /// An internal component (batch worker, janitor, auto-approval).
    System { name: String },
}

impl Actor {
    pub fn system(name: impl Into<String>) -> Self {
        Self::System { name: name.into() }
    }

    /// Short identity string recorded on review decisions and logs.
    pub fn label(&self) -> String {
        match self {
            Self::Moderator { id } => id.clone(),
            Self::Client { source } => format!("client:{source}"),
            Self::Peer { domain } => format!("peer:{domain}"),
            Self::System { name } => name.clone(),
        }
    }
}

/// Request-scoped values threaded through every core call.
///
/// The deadline bounds each repository call. A transaction whose call times
/// out is dropped, which rolls it back.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub actor: Actor,
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            actor,
            deadline: None,
        }
    }

    pub fn system(name: impl Into<String>) -> Self {
        Self::new(Actor::system(name))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Same caller, fresh request id and a new deadline. Used for the
    /// per-item work of a batch.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            actor: self.actor.clone(),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run one repository call under the request deadline.
    pub async fn bound<T, F>(&self, fut: F) -> catalog::Result<T>
    where
        F: Future<Output = catalog::Result<T>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| catalog::Error::DeadlineExceeded)?,
            None => fut.await,
        }
    }
}
