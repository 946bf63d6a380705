//! Editorial operations on stored events, places and organizations.
//!
//! Deletion is always soft: the row stays (so merges and tombstones can
//! point at it) and an immutable tombstone records the last public state.

mod error;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::models::{EntityKind, Event, LifecycleState, Tombstone};
use crate::catalog::{CatalogStore, CatalogTx};
use crate::dedup;
use crate::models::RequestContext;

pub use error::{Error, Result};

/// Partial edit of an event. `None` leaves a field untouched; an empty
/// string clears an optional one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub image: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Only the public states a moderator may set directly.
    pub lifecycle: Option<LifecycleState>,
}

#[derive(Clone)]
pub struct LifecycleService {
    store: Arc<dyn CatalogStore>,
    node_domain: String,
}

impl LifecycleService {
    pub fn new(store: Arc<dyn CatalogStore>, node_domain: impl Into<String>) -> Self {
        Self {
            store,
            node_domain: node_domain.into(),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(event_id = %id))]
    pub async fn publish(&self, ctx: &RequestContext, id: &str) -> Result<Event> {
        self.set_lifecycle(ctx, id, LifecycleState::Published).await
    }

    /// Back to draft; the event stays stored but leaves public listings.
    #[tracing::instrument(level = "debug", skip_all, fields(event_id = %id))]
    pub async fn unpublish(&self, ctx: &RequestContext, id: &str) -> Result<Event> {
        self.set_lifecycle(ctx, id, LifecycleState::Draft).await
    }

    async fn set_lifecycle(
        &self,
        ctx: &RequestContext,
        id: &str,
        state: LifecycleState,
    ) -> Result<Event> {
        let mut tx = ctx.bound(self.store.begin()).await?;
        let mut event = load_live_event(ctx, tx.as_mut(), id).await?;
        if event.lifecycle != state {
            event.lifecycle = state;
            event.updated_at = Utc::now();
            ctx.bound(tx.update_event(&event)).await?;
        }
        ctx.bound(tx.commit()).await?;
        tracing::info!(event_id = %event.id, lifecycle = state.as_str(), "event lifecycle changed");
        Ok(event)
    }

    /// Apply a partial edit and refresh the fingerprint.
    #[tracing::instrument(level = "debug", skip_all, fields(event_id = %id))]
    pub async fn update(
        &self,
        ctx: &RequestContext,
        id: &str,
        update: &EventUpdate,
    ) -> Result<Event> {
        if matches!(update.lifecycle, Some(LifecycleState::Deleted)) {
            return Err(Error::InvalidInput(
                "use delete_event to delete an event".to_string(),
            ));
        }
        let now = Utc::now();
        let mut tx = ctx.bound(self.store.begin()).await?;
        let mut event = load_live_event(ctx, tx.as_mut(), id).await?;
        apply_update(&mut event, update)?;
        event.updated_at = now;

        let venue = match &event.venue_id {
            Some(venue_id) => ctx.bound(tx.get_place(venue_id)).await?,
            None => None,
        };
        if event.fingerprint.is_some() || event.federation_uri.is_none() {
            event.fingerprint = dedup::event_fingerprint(&event, venue.as_ref());
        }

        match ctx.bound(tx.update_event(&event)).await {
            Ok(()) => {}
            Err(crate::catalog::Error::Conflict { constraint }) => {
                return Err(Error::Conflict { constraint })
            }
            Err(e) => return Err(e.into()),
        }
        ctx.bound(tx.commit()).await?;
        Ok(event)
    }

    /// Soft-delete an event and record its tombstone.
    #[tracing::instrument(level = "debug", skip_all, fields(event_id = %id))]
    pub async fn delete_event(
        &self,
        ctx: &RequestContext,
        id: &str,
        reason: &str,
    ) -> Result<Tombstone> {
        let reason = required_reason(reason)?;
        let now = Utc::now();
        let mut tx = ctx.bound(self.store.begin()).await?;
        let mut event = load_live_event(ctx, tx.as_mut(), id).await?;
        let tombstone = Tombstone::for_event(&event, &self.node_domain, reason, None, now);
        event.mark_deleted(reason, None, now);
        ctx.bound(tx.update_event(&event)).await?;
        ctx.bound(tx.insert_tombstone(&tombstone)).await?;
        ctx.bound(tx.commit()).await?;
        tracing::info!(event_id = %id, "event deleted");
        Ok(tombstone)
    }

    /// Fold `duplicate` into `primary`. The primary gains any field it was
    /// missing; the duplicate is soft-deleted and its tombstone points at
    /// the primary.
    #[tracing::instrument(level = "debug", skip_all, fields(primary = %primary_id, duplicate = %duplicate_id))]
    pub async fn merge_events(
        &self,
        ctx: &RequestContext,
        primary_id: &str,
        duplicate_id: &str,
    ) -> Result<Event> {
        if primary_id == duplicate_id {
            return Err(Error::CannotMergeSameEvent);
        }
        let now = Utc::now();
        let mut tx = ctx.bound(self.store.begin()).await?;
        let mut primary = load_live_event(ctx, tx.as_mut(), primary_id).await?;
        let mut duplicate = load_live_event(ctx, tx.as_mut(), duplicate_id).await?;

        let superseded_by = primary.canonical_uri(&self.node_domain);
        let tombstone = Tombstone::for_event(
            &duplicate,
            &self.node_domain,
            "merged",
            Some(superseded_by),
            now,
        );
        // The source identity moves to the primary so resubmissions land there.
        let moved_source = match primary.source {
            None => duplicate.source.take(),
            Some(_) => None,
        };
        fill_event_from(&mut primary, &duplicate);
        duplicate.mark_deleted("merged", Some(primary.id.clone()), now);

        // Delete first: the unique indexes only cover live rows.
        ctx.bound(tx.update_event(&duplicate)).await?;
        if moved_source.is_some() {
            primary.source = moved_source;
        }
        primary.updated_at = now;
        ctx.bound(tx.update_event(&primary)).await?;
        ctx.bound(tx.insert_tombstone(&tombstone)).await?;
        ctx.bound(tx.commit()).await?;
        tracing::info!(primary = %primary.id, duplicate = %duplicate_id, "events merged");
        Ok(primary)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(place_id = %id))]
    pub async fn delete_place(
        &self,
        ctx: &RequestContext,
        id: &str,
        reason: &str,
    ) -> Result<Tombstone> {
        let reason = required_reason(reason)?;
        let now = Utc::now();
        let mut tx = ctx.bound(self.store.begin()).await?;
        let mut place = ctx
            .bound(tx.get_place(id))
            .await?
            .filter(|p| p.deleted_at.is_none())
            .ok_or_else(|| Error::NotFound(format!("place {id}")))?;
        let tombstone = Tombstone::for_place(&place, &self.node_domain, reason, now);
        place.deleted_at = Some(now);
        place.updated_at = now;
        ctx.bound(tx.update_place(&place)).await?;
        ctx.bound(tx.insert_tombstone(&tombstone)).await?;
        ctx.bound(tx.commit()).await?;
        Ok(tombstone)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(organization_id = %id))]
    pub async fn delete_organization(
        &self,
        ctx: &RequestContext,
        id: &str,
        reason: &str,
    ) -> Result<Tombstone> {
        let reason = required_reason(reason)?;
        let now = Utc::now();
        let mut tx = ctx.bound(self.store.begin()).await?;
        let mut org = ctx
            .bound(tx.get_organization(id))
            .await?
            .filter(|o| o.deleted_at.is_none())
            .ok_or_else(|| Error::NotFound(format!("organization {id}")))?;
        let tombstone = Tombstone::for_organization(&org, &self.node_domain, reason, now);
        org.deleted_at = Some(now);
        org.updated_at = now;
        ctx.bound(tx.update_organization(&org)).await?;
        ctx.bound(tx.insert_tombstone(&tombstone)).await?;
        ctx.bound(tx.commit()).await?;
        Ok(tombstone)
    }

    /// The tombstone of a deleted entity. `NotFound` means it was never
    /// deleted here (or never existed).
    #[tracing::instrument(level = "debug", skip_all, fields(kind = %kind, id = %id))]
    pub async fn tombstone(
        &self,
        ctx: &RequestContext,
        kind: EntityKind,
        id: &str,
    ) -> Result<Tombstone> {
        let mut tx = ctx.bound(self.store.begin()).await?;
        let tombstone = ctx.bound(tx.get_tombstone(kind, id)).await?;
        tx.rollback().await?;
        tombstone.ok_or_else(|| Error::NotFound(format!("{kind} {id}")))
    }
}

fn required_reason(reason: &str) -> Result<&str> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(Error::InvalidInput("deletion reason is required".to_string()));
    }
    Ok(reason)
}

async fn load_live_event(
    ctx: &RequestContext,
    tx: &mut dyn CatalogTx,
    id: &str,
) -> Result<Event> {
    match ctx.bound(tx.get_event(id)).await? {
        None => Err(Error::NotFound(format!("event {id}"))),
        Some(e) if e.is_deleted() => Err(Error::EventDeleted(id.to_string())),
        Some(e) => Ok(e),
    }
}

fn apply_update(event: &mut Event, update: &EventUpdate) -> Result<()> {
    if let Some(name) = update.name.as_deref().map(str::trim) {
        if name.is_empty() {
            return Err(Error::InvalidInput("name cannot be empty".to_string()));
        }
        event.name = name.to_string();
    }
    let set = |slot: &mut Option<String>, value: &Option<String>| {
        if let Some(v) = value.as_deref().map(str::trim) {
            *slot = (!v.is_empty()).then(|| v.to_string());
        }
    };
    set(&mut event.description, &update.description);
    set(&mut event.url, &update.url);
    set(&mut event.image_url, &update.image);
    if let Some(keywords) = &update.keywords {
        event.keywords = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
    }
    if let Some(state) = update.lifecycle {
        event.lifecycle = state;
    }
    if update.start_date.is_some() || update.end_date.is_some() {
        let Some(occ) = event.occurrences.iter_mut().min_by_key(|o| o.start) else {
            return Err(Error::InvalidInput("event has no occurrence".to_string()));
        };
        if let Some(start) = update.start_date {
            occ.start = start;
        }
        if let Some(end) = update.end_date {
            occ.end = Some(end);
        }
        if occ.end.is_some_and(|end| end < occ.start) {
            return Err(Error::InvalidInput("endDate is before startDate".to_string()));
        }
    }
    Ok(())
}

fn fill_event_from(primary: &mut Event, other: &Event) {
    fn fill(slot: &mut Option<String>, value: &Option<String>) {
        if slot.is_none() {
            slot.clone_from(value);
        }
    }
    fill(&mut primary.description, &other.description);
    fill(&mut primary.url, &other.url);
    fill(&mut primary.image_url, &other.image_url);
    fill(&mut primary.venue_id, &other.venue_id);
    fill(&mut primary.organizer_id, &other.organizer_id);
    fill(&mut primary.virtual_url, &other.virtual_url);
    for kw in &other.keywords {
        if !primary.keywords.contains(kw) {
            primary.keywords.push(kw.clone());
        }
    }
    for lang in &other.in_language {
        if !primary.in_language.contains(lang) {
            primary.in_language.push(lang.clone());
        }
    }
    if primary.is_accessible_for_free.is_none() {
        primary.is_accessible_for_free = other.is_accessible_for_free;
    }
    for (k, v) in &other.extensions {
        primary.extensions.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::{AttendanceMode, Occurrence, SourceIdentity, CC0_LICENSE};
    use crate::catalog::MemoryCatalog;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn event(id: &str, name: &str) -> Event {
        let now = Utc::now();
        Event {
            id: id.into(),
            name: name.into(),
            description: None,
            url: None,
            image_url: None,
            keywords: vec!["jazz".into()],
            in_language: vec![],
            is_accessible_for_free: None,
            attendance_mode: AttendanceMode::Online,
            event_status: None,
            license_url: CC0_LICENSE.into(),
            lifecycle: LifecycleState::Published,
            confidence: Some(0.9),
            organizer_id: None,
            venue_id: None,
            virtual_url: Some("https://stream.example/live".into()),
            source: None,
            fingerprint: Some(format!("fp-{id}")),
            federation_uri: None,
            origin_node: None,
            extensions: Default::default(),
            deleted_at: None,
            deletion_reason: None,
            merged_into: None,
            created_at: now,
            updated_at: now,
            occurrences: vec![Occurrence {
                id: format!("occ-{id}"),
                event_id: id.into(),
                start: ts("2026-07-10T19:00:00Z"),
                end: None,
                door_time: None,
                timezone: "UTC".into(),
                venue_id: None,
                virtual_url: None,
                ticket_url: None,
                price_min: None,
                price_max: None,
                currency: None,
            }],
        }
    }

    async fn seed(store: &MemoryCatalog, events: &[Event]) {
        let mut tx = store.begin().await.unwrap();
        for e in events {
            tx.insert_event(e).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    fn service(store: &MemoryCatalog) -> LifecycleService {
        LifecycleService::new(Arc::new(store.clone()), "cal.example")
    }

    #[tokio::test]
    async fn delete_leaves_tombstone_and_blocks_edits() {
        let store = MemoryCatalog::new();
        seed(&store, &[event("E1", "Jazz Night")]).await;
        let svc = service(&store);
        let ctx = RequestContext::system("test");

        let err = svc.delete_event(&ctx, "E1", " ").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let t = svc.delete_event(&ctx, "E1", "spam").await.unwrap();
        assert_eq!(t.uri, "https://cal.example/events/E1");
        assert_eq!(svc.tombstone(&ctx, EntityKind::Event, "E1").await.unwrap(), t);

        let err = svc.publish(&ctx, "E1").await.unwrap_err();
        assert!(matches!(err, Error::EventDeleted(_)));
        let err = svc.tombstone(&ctx, EntityKind::Event, "E2").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn merge_fills_primary_and_supersedes_duplicate() {
        let store = MemoryCatalog::new();
        let mut dup = event("E2", "Jazz Night!");
        dup.description = Some("Live quartet".into());
        dup.keywords = vec!["live".into()];
        dup.source = Some(SourceIdentity {
            key: "https://scraper.example".into(),
            external_id: "42".into(),
        });
        seed(&store, &[event("E1", "Jazz Night"), dup]).await;
        let svc = service(&store);
        let ctx = RequestContext::system("test");

        assert!(matches!(
            svc.merge_events(&ctx, "E1", "E1").await,
            Err(Error::CannotMergeSameEvent)
        ));

        let primary = svc.merge_events(&ctx, "E1", "E2").await.unwrap();
        assert_eq!(primary.description.as_deref(), Some("Live quartet"));
        assert_eq!(primary.keywords, vec!["jazz".to_string(), "live".to_string()]);
        assert_eq!(primary.source.as_ref().unwrap().external_id, "42");

        let dup = store.get_event("E2").await.unwrap().unwrap();
        assert!(dup.is_deleted());
        assert_eq!(dup.merged_into.as_deref(), Some("E1"));
        let t = svc.tombstone(&ctx, EntityKind::Event, "E2").await.unwrap();
        assert_eq!(
            t.superseded_by.as_deref(),
            Some("https://cal.example/events/E1")
        );
    }

    #[tokio::test]
    async fn update_refreshes_fingerprint_and_rejects_reversed_dates() {
        let store = MemoryCatalog::new();
        seed(&store, &[event("E1", "Jazz Night")]).await;
        let svc = service(&store);
        let ctx = RequestContext::system("test");

        let updated = svc
            .update(
                &ctx,
                "E1",
                &EventUpdate {
                    name: Some("Jazz Night Encore".into()),
                    ..EventUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Jazz Night Encore");
        assert_ne!(updated.fingerprint.as_deref(), Some("fp-E1"));

        let err = svc
            .update(
                &ctx,
                "E1",
                &EventUpdate {
                    end_date: Some(ts("2026-07-01T00:00:00Z")),
                    ..EventUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unpublish_then_publish() {
        let store = MemoryCatalog::new();
        seed(&store, &[event("E1", "Jazz Night")]).await;
        let svc = service(&store);
        let ctx = RequestContext::system("test");
        assert_eq!(
            svc.unpublish(&ctx, "E1").await.unwrap().lifecycle,
            LifecycleState::Draft
        );
        assert_eq!(
            svc.publish(&ctx, "E1").await.unwrap().lifecycle,
            LifecycleState::Published
        );
    }
}
