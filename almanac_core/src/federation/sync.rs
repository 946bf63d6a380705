use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use ulid::Ulid;

use super::nodes::{normalize_domain, NodeRegistry};
use super::payload::{self, EntityRef, FederatedEvent};
use super::{Error, Result};
use crate::catalog::identity::{resolve_organization, resolve_place};
use crate::catalog::models::{AttendanceMode, Event, Occurrence, Place, CC0_LICENSE};
use crate::catalog::{CatalogStore, CatalogTx};
use crate::dedup;
use crate::idempotency::{request_hash, Begin, Claim, IdempotencyCoordinator};
use crate::models::RequestContext;

/// A lost unique-constraint race is re-resolved once before surfacing.
const MAX_WRITE_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    /// Local ULID; stable across re-syncs of the same federation URI.
    pub event_id: String,
    pub federation_uri: String,
    pub is_new: bool,
    /// Answered from a completed idempotency key without writing.
    pub replayed: bool,
}

/// Merges events pushed by peer nodes into the local catalog.
///
/// Peer events are matched by their federation URI only, never by local
/// ULID, and share place/organization identity with direct ingestion.
#[derive(Clone)]
pub struct FederationSync {
    store: Arc<dyn CatalogStore>,
    idempotency: IdempotencyCoordinator,
    nodes: NodeRegistry,
}

enum Attempt {
    Done(SyncResult),
    Raced(String),
}

/// `host[:port]` of a federation URI.
fn origin_domain(uri: &str) -> Result<String> {
    let parsed = url::Url::parse(uri).map_err(|_| Error::MissingId)?;
    let host = parsed.host_str().ok_or(Error::MissingId)?;
    Ok(match parsed.port() {
        Some(port) => normalize_domain(&format!("{host}:{port}")),
        None => normalize_domain(host),
    })
}

impl FederationSync {
    pub fn new(store: Arc<dyn CatalogStore>, idempotency: IdempotencyCoordinator) -> Self {
        Self {
            nodes: NodeRegistry::new(store.clone()),
            store,
            idempotency,
        }
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Insert or update the local copy of a peer's event.
    #[tracing::instrument(level = "debug", skip_all, fields(request_id = %ctx.request_id))]
    pub async fn sync_event(
        &self,
        ctx: &RequestContext,
        payload: &Value,
        token: Option<&str>,
    ) -> Result<SyncResult> {
        let event = payload::parse(payload)?;
        let domain = origin_domain(&event.id)?;

        let node = self.nodes.get_node(ctx, &domain).await?;
        if !node.sync_enabled {
            return Err(Error::NodeSyncDisabled(domain));
        }

        let claim = match token {
            Some(token) => {
                let hash = request_hash(payload)?;
                match self.idempotency.begin(ctx, token, &hash).await? {
                    Begin::AlreadyCompleted(event_id) => {
                        return self.replay(ctx, &event_id, &event.id).await
                    }
                    Begin::ProceedExclusive(claim) => Some(claim),
                }
            }
            None => None,
        };

        let result = self.run(ctx, &event, &domain, claim.as_ref()).await;
        if let (Err(_), Some(claim)) = (&result, &claim) {
            if let Err(release) = self.idempotency.abandon(ctx, claim).await {
                tracing::warn!(key = %claim.key, error = %release, "failed releasing idempotency key");
            }
        }
        let result = result?;

        if let Err(err) = self.nodes.record_sync(ctx, &domain, Utc::now()).await {
            tracing::warn!(domain = %domain, error = %err, "failed recording node sync time");
        }
        tracing::info!(
            event_id = %result.event_id,
            federation_uri = %result.federation_uri,
            is_new = result.is_new,
            "federated event synced"
        );
        Ok(result)
    }

    async fn replay(
        &self,
        ctx: &RequestContext,
        event_id: &str,
        federation_uri: &str,
    ) -> Result<SyncResult> {
        let event = ctx.bound(self.store.get_event(event_id)).await?;
        Ok(SyncResult {
            event_id: event_id.to_string(),
            federation_uri: event
                .and_then(|e| e.federation_uri)
                .unwrap_or_else(|| federation_uri.to_string()),
            is_new: false,
            replayed: true,
        })
    }

    async fn run(
        &self,
        ctx: &RequestContext,
        event: &FederatedEvent,
        domain: &str,
        claim: Option<&Claim>,
    ) -> Result<SyncResult> {
        let mut last_constraint = String::new();
        for attempt in 0..MAX_WRITE_ATTEMPTS {
            match self.attempt(ctx, event, domain, claim, Utc::now()).await? {
                Attempt::Done(result) => return Ok(result),
                Attempt::Raced(constraint) => {
                    tracing::debug!(attempt, constraint = %constraint, "lost sync write race; retrying");
                    last_constraint = constraint;
                }
            }
        }
        Err(Error::Conflict {
            constraint: last_constraint,
        })
    }

    async fn attempt(
        &self,
        ctx: &RequestContext,
        incoming: &FederatedEvent,
        domain: &str,
        claim: Option<&Claim>,
        now: DateTime<Utc>,
    ) -> Result<Attempt> {
        let mut tx = ctx.bound(self.store.begin()).await?;
        let existing = ctx
            .bound(tx.find_event_by_federation_uri(&incoming.id))
            .await?;

        let mut extensions = incoming.extensions.clone();
        let venue = match &incoming.location {
            Some(EntityRef::Inline(place)) => {
                Some(ctx.bound(resolve_place(tx.as_mut(), place, now)).await?)
            }
            Some(EntityRef::Uri(uri)) => {
                let found = ctx.bound(tx.find_place_by_federation_uri(uri)).await?;
                if found.is_none() {
                    extensions.insert("location".into(), json!(uri));
                }
                found
            }
            None => None,
        };
        let organizer_id = match &incoming.organizer {
            Some(EntityRef::Inline(org)) => Some(
                ctx.bound(resolve_organization(tx.as_mut(), org, now))
                    .await?
                    .id,
            ),
            Some(EntityRef::Uri(uri)) => {
                let found = ctx
                    .bound(tx.find_organization_by_federation_uri(uri))
                    .await?;
                if found.is_none() {
                    extensions.insert("organizer".into(), json!(uri));
                }
                found.map(|o| o.id)
            }
            None => None,
        };

        let is_new = existing.is_none();
        let mut event = match existing {
            Some(event) => event,
            None => blank_event(Ulid::new().to_string(), now),
        };
        apply(&mut event, incoming, domain, venue.as_ref(), organizer_id, extensions, now);

        // Another live event may already own this fingerprint (e.g. the same
        // show ingested directly); the federated copy then goes without one.
        let fingerprint = dedup::event_fingerprint(&event, venue.as_ref());
        event.fingerprint = match fingerprint {
            Some(fp) => match ctx.bound(tx.find_event_by_fingerprint(&fp)).await? {
                Some(other) if other.id != event.id => None,
                _ => Some(fp),
            },
            None => None,
        };

        let write = if is_new {
            ctx.bound(tx.insert_event(&event)).await
        } else {
            ctx.bound(tx.update_event(&event)).await
        };
        if let Some(constraint) = raced(write)? {
            return Ok(Attempt::Raced(constraint));
        }
        if let Some(claim) = claim {
            self.idempotency
                .complete_in(tx.as_mut(), claim, &event.id)
                .await?;
        }
        if let Some(constraint) = raced(ctx.bound(tx.commit()).await)? {
            return Ok(Attempt::Raced(constraint));
        }

        Ok(Attempt::Done(SyncResult {
            event_id: event.id,
            federation_uri: incoming.id.clone(),
            is_new,
            replayed: false,
        }))
    }
}

fn raced(res: crate::catalog::Result<()>) -> Result<Option<String>> {
    match res {
        Ok(()) => Ok(None),
        Err(crate::catalog::Error::Conflict { constraint }) => Ok(Some(constraint)),
        Err(e) => Err(e.into()),
    }
}

fn blank_event(id: String, now: DateTime<Utc>) -> Event {
    Event {
        id,
        name: String::new(),
        description: None,
        url: None,
        image_url: None,
        keywords: vec![],
        in_language: vec![],
        is_accessible_for_free: None,
        attendance_mode: AttendanceMode::Offline,
        event_status: None,
        license_url: CC0_LICENSE.to_string(),
        lifecycle: crate::catalog::models::LifecycleState::Published,
        confidence: None,
        organizer_id: None,
        venue_id: None,
        virtual_url: None,
        source: None,
        fingerprint: None,
        federation_uri: None,
        origin_node: None,
        extensions: serde_json::Map::new(),
        deleted_at: None,
        deletion_reason: None,
        merged_into: None,
        created_at: now,
        updated_at: now,
        occurrences: vec![],
    }
}

/// Overwrite the peer-owned fields of `event`. The local id, creation time
/// and any source identity are kept.
#[allow(clippy::too_many_arguments)]
fn apply(
    event: &mut Event,
    incoming: &FederatedEvent,
    domain: &str,
    venue: Option<&Place>,
    organizer_id: Option<String>,
    extensions: serde_json::Map<String, Value>,
    now: DateTime<Utc>,
) {
    let venue_id = venue.map(|p| p.id.clone());
    event.name = incoming.name.clone();
    event.description = incoming.description.clone();
    event.url = incoming.url.clone();
    event.image_url = incoming.image.clone();
    event.keywords = incoming.keywords.clone();
    event.in_language = incoming.in_language.clone();
    event.is_accessible_for_free = incoming.is_accessible_for_free;
    event.attendance_mode = incoming.attendance_mode.unwrap_or_else(|| {
        AttendanceMode::from_locations(venue_id.is_some(), incoming.virtual_url.is_some())
    });
    event.event_status = incoming.event_status.clone();
    event.license_url = CC0_LICENSE.to_string();
    event.lifecycle = incoming.lifecycle();
    event.organizer_id = organizer_id;
    event.venue_id = venue_id.clone();
    event.virtual_url = incoming.virtual_url.clone();
    event.federation_uri = Some(incoming.id.clone());
    event.origin_node = Some(domain.to_string());
    event.extensions = extensions;
    if let Some(license) = &incoming.license {
        if license != CC0_LICENSE {
            event
                .extensions
                .insert("peerLicense".into(), json!(license));
        }
    }
    event.updated_at = now;

    let occurrence_id = event
        .summary_occurrence()
        .map(|o| o.id.clone())
        .unwrap_or_else(|| Ulid::new().to_string());
    event.occurrences = vec![Occurrence {
        id: occurrence_id,
        event_id: event.id.clone(),
        start: incoming.start,
        end: incoming.end.filter(|end| *end >= incoming.start),
        door_time: incoming.door_time,
        timezone: "UTC".to_string(),
        venue_id,
        virtual_url: incoming.virtual_url.clone(),
        ticket_url: None,
        price_min: None,
        price_max: None,
        currency: None,
    }];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::LifecycleState;
    use crate::catalog::MemoryCatalog;
    use crate::config::IdempotencyConfig;
    use crate::federation::nodes::NodeRegistration;

    async fn setup(store: &MemoryCatalog, sync_enabled: bool) -> FederationSync {
        let store: Arc<dyn CatalogStore> = Arc::new(store.clone());
        let sync = FederationSync::new(
            store.clone(),
            IdempotencyCoordinator::new(store, IdempotencyConfig::default()),
        );
        sync.nodes()
            .register_node(
                &RequestContext::system("test"),
                NodeRegistration {
                    domain: "peer.example".into(),
                    name: "Peer".into(),
                    base_url: "https://peer.example".into(),
                    trust_level: 5,
                    sync_enabled,
                },
            )
            .await
            .unwrap();
        sync
    }

    fn doc(name: &str) -> Value {
        json!({
            "@context": "https://schema.org",
            "@id": "https://peer.example/events/E1",
            "@type": "Event",
            "name": name,
            "startDate": "2026-07-10T19:00:00Z",
            "location": {"name": "The Rex", "addressLocality": "Toronto"},
            "organizer": {"name": "Rex Presents", "url": "https://rex.example"},
            "x-peer-rating": 4
        })
    }

    #[tokio::test]
    async fn resync_updates_in_place() {
        let store = MemoryCatalog::new();
        let sync = setup(&store, true).await;
        let ctx = RequestContext::system("test");

        let first = sync.sync_event(&ctx, &doc("Jazz Night"), None).await.unwrap();
        assert!(first.is_new);
        let second = sync
            .sync_event(&ctx, &doc("Jazz Night (late set)"), None)
            .await
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.event_id, first.event_id);

        let event = store.get_event(&first.event_id).await.unwrap().unwrap();
        assert_eq!(event.name, "Jazz Night (late set)");
        assert_eq!(event.lifecycle, LifecycleState::Published);
        assert_eq!(event.license_url, CC0_LICENSE);
        assert_eq!(event.origin_node.as_deref(), Some("peer.example"));
        assert_eq!(event.extensions.get("x-peer-rating"), Some(&json!(4)));
        assert_eq!(event.occurrences.len(), 1);

        let node = sync
            .nodes()
            .get_node(&ctx, "peer.example")
            .await
            .unwrap();
        assert!(node.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn unknown_and_disabled_nodes_are_refused() {
        let store = MemoryCatalog::new();
        let sync = setup(&store, false).await;
        let ctx = RequestContext::system("test");
        let err = sync.sync_event(&ctx, &doc("Jazz"), None).await.unwrap_err();
        assert!(matches!(err, Error::NodeSyncDisabled(d) if d == "peer.example"));

        let mut other = doc("Jazz");
        other["@id"] = json!("https://stranger.example/e/1");
        let err = sync.sync_event(&ctx, &other, None).await.unwrap_err();
        assert!(matches!(err, Error::UnknownNode(d) if d == "stranger.example"));
    }

    #[tokio::test]
    async fn token_replays_without_writing() {
        let store = MemoryCatalog::new();
        let sync = setup(&store, true).await;
        let ctx = RequestContext::system("test");
        let first = sync
            .sync_event(&ctx, &doc("Jazz Night"), Some("tok-1"))
            .await
            .unwrap();
        let again = sync
            .sync_event(&ctx, &doc("Jazz Night"), Some("tok-1"))
            .await
            .unwrap();
        assert!(again.replayed);
        assert!(!again.is_new);
        assert_eq!(again.event_id, first.event_id);

        let err = sync
            .sync_event(&ctx, &doc("Something else"), Some("tok-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Idempotency(crate::idempotency::Error::PayloadMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_status_maps_to_lifecycle() {
        let store = MemoryCatalog::new();
        let sync = setup(&store, true).await;
        let mut d = doc("Jazz Night");
        d["eventStatus"] = json!("https://schema.org/EventCancelled");
        let res = sync
            .sync_event(&RequestContext::system("test"), &d, None)
            .await
            .unwrap();
        let event = store.get_event(&res.event_id).await.unwrap().unwrap();
        assert_eq!(event.lifecycle, LifecycleState::Cancelled);
    }

    #[test]
    fn origin_domain_keeps_explicit_port() {
        assert_eq!(origin_domain("https://Peer.Example/e/1").unwrap(), "peer.example");
        assert_eq!(
            origin_domain("http://peer.example:8080/e/1").unwrap(),
            "peer.example:8080"
        );
    }
}
