//! Moderation queue for submissions that failed automatic checks.
//!
//! Entries move `pending -> approved | rejected` exactly once. The
//! repository's conditional transition is what makes two racing moderators
//! end with one success and one [`Error::AlreadyReviewed`].

mod error;
pub mod transitions;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::catalog::models::{
    Event, LifecycleState, ReviewEntry, ReviewStatus, ReviewTransition, Tombstone,
};
use crate::catalog::{CatalogStore, CatalogTx};
use crate::dedup;
use crate::models::RequestContext;

pub use error::{Error, Result};
pub use transitions::ReviewCorrections;

pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewDecision {
    pub entry: ReviewEntry,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewPage {
    pub entries: Vec<ReviewEntry>,
    /// Pass back as `cursor` to continue; `None` when the queue is exhausted.
    pub next_cursor: Option<String>,
}

#[derive(Clone)]
pub struct ReviewQueue {
    store: Arc<dyn CatalogStore>,
    node_domain: String,
}

impl ReviewQueue {
    pub fn new(store: Arc<dyn CatalogStore>, node_domain: impl Into<String>) -> Self {
        Self {
            store,
            node_domain: node_domain.into(),
        }
    }

    /// Publish the linked event.
    #[tracing::instrument(level = "debug", skip_all, fields(entry_id = %entry_id, reviewer = %reviewer))]
    pub async fn approve(
        &self,
        ctx: &RequestContext,
        entry_id: &str,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<ReviewDecision> {
        let now = Utc::now();
        let mut tx = ctx.bound(self.store.begin()).await?;
        let entry = load_entry(ctx, tx.as_mut(), entry_id).await?;
        let transition = transitions::approve(&entry, reviewer, notes, now)?;
        let mut event = load_event(ctx, tx.as_mut(), &entry.event_id).await?;

        let entry = decide(ctx, tx.as_mut(), entry_id, &transition).await?;
        event.lifecycle = LifecycleState::Published;
        event.updated_at = now;
        ctx.bound(tx.update_event(&event)).await?;
        ctx.bound(tx.commit()).await?;

        tracing::info!(event_id = %event.id, "review approved");
        Ok(ReviewDecision { entry, event })
    }

    /// Soft-delete the linked event and keep the entry as rejection memory.
    #[tracing::instrument(level = "debug", skip_all, fields(entry_id = %entry_id, reviewer = %reviewer))]
    pub async fn reject(
        &self,
        ctx: &RequestContext,
        entry_id: &str,
        reviewer: &str,
        reason: &str,
    ) -> Result<ReviewDecision> {
        let now = Utc::now();
        let mut tx = ctx.bound(self.store.begin()).await?;
        let entry = load_entry(ctx, tx.as_mut(), entry_id).await?;
        let transition = transitions::reject(&entry, reviewer, reason, now)?;
        let mut event = load_event(ctx, tx.as_mut(), &entry.event_id).await?;

        let entry = decide(ctx, tx.as_mut(), entry_id, &transition).await?;
        let reason = transition.rejection_reason.as_deref().unwrap_or(reason);
        event.mark_deleted(reason, None, now);
        ctx.bound(tx.update_event(&event)).await?;
        let tombstone = Tombstone::for_event(&event, &self.node_domain, reason, None, now);
        ctx.bound(tx.insert_tombstone(&tombstone)).await?;
        ctx.bound(tx.commit()).await?;

        tracing::info!(event_id = %event.id, "review rejected");
        Ok(ReviewDecision { entry, event })
    }

    /// Apply operator corrections, record them in the notes and publish.
    #[tracing::instrument(level = "debug", skip_all, fields(entry_id = %entry_id, reviewer = %reviewer))]
    pub async fn fix(
        &self,
        ctx: &RequestContext,
        entry_id: &str,
        reviewer: &str,
        corrections: &ReviewCorrections,
        notes: Option<&str>,
    ) -> Result<ReviewDecision> {
        let now = Utc::now();
        let mut tx = ctx.bound(self.store.begin()).await?;
        let entry = load_entry(ctx, tx.as_mut(), entry_id).await?;
        if entry.status != ReviewStatus::Pending {
            return Err(Error::AlreadyReviewed {
                status: entry.status,
            });
        }
        let mut event = load_event(ctx, tx.as_mut(), &entry.event_id).await?;
        let changed = transitions::apply_corrections(&mut event, corrections, now)?;
        let transition = transitions::fix(&entry, reviewer, &changed, notes, now)?;

        let venue = match &event.venue_id {
            Some(id) => ctx.bound(tx.get_place(id)).await?,
            None => None,
        };
        if let Some(fp) = dedup::event_fingerprint(&event, venue.as_ref()) {
            event.fingerprint = Some(fp);
        }

        let entry = decide(ctx, tx.as_mut(), entry_id, &transition).await?;
        event.lifecycle = LifecycleState::Published;
        event.updated_at = now;
        ctx.bound(tx.update_event(&event)).await?;
        ctx.bound(tx.commit()).await?;

        tracing::info!(event_id = %event.id, corrections = changed.len(), "review fixed");
        Ok(ReviewDecision { entry, event })
    }

    /// Oldest first. `limit` is clamped to `1..=100`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn list(
        &self,
        ctx: &RequestContext,
        status: Option<ReviewStatus>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ReviewPage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut tx = ctx.bound(self.store.begin()).await?;
        let mut entries = ctx
            .bound(tx.list_review_entries(status, cursor, limit + 1))
            .await?;
        tx.rollback().await?;

        let next_cursor = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(|e| e.id.clone())
        } else {
            None
        };
        Ok(ReviewPage {
            entries,
            next_cursor,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(entry_id = %entry_id))]
    pub async fn get(&self, ctx: &RequestContext, entry_id: &str) -> Result<ReviewEntry> {
        ctx.bound(self.store.get_review_entry(entry_id))
            .await?
            .ok_or_else(|| Error::NotFound(entry_id.to_string()))
    }
}

async fn load_entry(
    ctx: &RequestContext,
    tx: &mut dyn CatalogTx,
    entry_id: &str,
) -> Result<ReviewEntry> {
    ctx.bound(tx.get_review_entry(entry_id))
        .await?
        .ok_or_else(|| Error::NotFound(entry_id.to_string()))
}

async fn load_event(ctx: &RequestContext, tx: &mut dyn CatalogTx, event_id: &str) -> Result<Event> {
    match ctx.bound(tx.get_event(event_id)).await? {
        Some(event) if !event.is_deleted() => Ok(event),
        _ => Err(Error::EventMissing(event_id.to_string())),
    }
}

/// The conditional write. Losing the race reports the winner's status.
async fn decide(
    ctx: &RequestContext,
    tx: &mut dyn CatalogTx,
    entry_id: &str,
    transition: &ReviewTransition,
) -> Result<ReviewEntry> {
    match ctx.bound(tx.transition_review(entry_id, transition)).await {
        Ok(Some(entry)) => Ok(entry),
        Ok(None) => {
            let status = ctx
                .bound(tx.get_review_entry(entry_id))
                .await?
                .map(|e| e.status)
                .unwrap_or(ReviewStatus::Pending);
            Err(Error::AlreadyReviewed { status })
        }
        Err(crate::catalog::Error::NotFound(_)) => Err(Error::NotFound(entry_id.to_string())),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{CandidateEvent, VirtualLocationInput};
    use crate::catalog::models::EntityKind;
    use crate::catalog::MemoryCatalog;
    use crate::config::{IdempotencyConfig, IngestConfig, ValidationConfig};
    use crate::idempotency::IdempotencyCoordinator;
    use crate::ingest::{IngestOptions, IngestService};

    fn ctx() -> RequestContext {
        RequestContext::system("test")
    }

    async fn flagged(store: &MemoryCatalog, name: &str) -> (String, String) {
        let dyn_store: Arc<dyn CatalogStore> = Arc::new(store.clone());
        let ingest = IngestService::new(
            dyn_store.clone(),
            IdempotencyCoordinator::new(dyn_store, IdempotencyConfig::default()),
            ValidationConfig::default(),
            IngestConfig::default(),
        );
        let res = ingest
            .ingest(
                &ctx(),
                &CandidateEvent {
                    name: name.into(),
                    start_date: "2026-07-10T19:00:00Z".into(),
                    virtual_location: Some(VirtualLocationInput {
                        url: "https://stream.example/live".into(),
                    }),
                    ..CandidateEvent::default()
                },
                IngestOptions::default(),
            )
            .await
            .unwrap();
        assert!(res.needs_review);
        (res.review_entry_id.unwrap(), res.event.id)
    }

    fn queue(store: &MemoryCatalog) -> ReviewQueue {
        ReviewQueue::new(Arc::new(store.clone()), "cal.example")
    }

    #[tokio::test]
    async fn approve_publishes_once() {
        let store = MemoryCatalog::new();
        let (entry_id, _) = flagged(&store, "Poetry Slam").await;
        let q = queue(&store);

        let d = q.approve(&ctx(), &entry_id, "alice", None).await.unwrap();
        assert_eq!(d.event.lifecycle, LifecycleState::Published);
        assert_eq!(d.entry.reviewed_by.as_deref(), Some("alice"));

        let err = q.approve(&ctx(), &entry_id, "alice", None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyReviewed {
                status: ReviewStatus::Approved
            }
        ));
    }

    #[tokio::test]
    async fn reject_deletes_and_tombstones() {
        let store = MemoryCatalog::new();
        let (entry_id, event_id) = flagged(&store, "Poetry Slam").await;
        let q = queue(&store);

        let d = q.reject(&ctx(), &entry_id, "bob", "spam").await.unwrap();
        assert!(d.event.is_deleted());
        assert_eq!(d.entry.rejection_reason.as_deref(), Some("spam"));

        let mut tx = store.begin().await.unwrap();
        let t = tx
            .get_tombstone(EntityKind::Event, &event_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.reason, "spam");
    }

    #[tokio::test]
    async fn fix_records_corrections() {
        let store = MemoryCatalog::new();
        let (entry_id, _) = flagged(&store, "Poetry Slam").await;
        let q = queue(&store);

        let d = q
            .fix(
                &ctx(),
                &entry_id,
                "carol",
                &ReviewCorrections {
                    description: Some("Open mic poetry".into()),
                    ..ReviewCorrections::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(d.event.description.as_deref(), Some("Open mic poetry"));
        assert_eq!(d.event.lifecycle, LifecycleState::Published);
        assert!(d
            .entry
            .review_notes
            .unwrap()
            .contains("description updated"));
    }

    #[tokio::test]
    async fn list_pages_oldest_first() {
        let store = MemoryCatalog::new();
        let mut ids = Vec::new();
        for name in ["A", "B", "C"] {
            ids.push(flagged(&store, name).await.0);
        }
        // ULIDs minted in the same millisecond are not ordered by creation.
        ids.sort();
        let q = queue(&store);

        let first = q
            .list(&ctx(), Some(ReviewStatus::Pending), None, 2)
            .await
            .unwrap();
        assert_eq!(
            first.entries.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            ids[..2].to_vec()
        );
        let cursor = first.next_cursor.unwrap();
        let rest = q
            .list(&ctx(), Some(ReviewStatus::Pending), Some(&cursor), 2)
            .await
            .unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert_eq!(rest.entries[0].id, ids[2]);
        assert!(rest.next_cursor.is_none());
    }

    #[tokio::test]
    async fn missing_entry_is_not_found() {
        let store = MemoryCatalog::new();
        let err = queue(&store)
            .approve(&ctx(), "01NOPE", "alice", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
