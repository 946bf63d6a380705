use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::models::{
    BatchState, BatchStatus, EntityKind, Event, FederationNode, IdempotencyKey, Organization,
    Place, ReviewEntry, ReviewStatus, ReviewTransition, SourceIdentity, Tombstone,
};
use super::traits::{CatalogStore, CatalogTx};
use super::{Error, Result};

#[derive(Debug, Clone, Default)]
struct CatalogState {
    events: BTreeMap<String, Event>,
    places: BTreeMap<String, Place>,
    organizations: BTreeMap<String, Organization>,
    tombstones: HashMap<(EntityKind, String), Tombstone>,
    idempotency: HashMap<String, IdempotencyKey>,
    reviews: BTreeMap<String, ReviewEntry>,
    nodes: HashMap<String, FederationNode>,
    batches: HashMap<String, BatchStatus>,
}

/// In-memory catalog for local development and tests.
///
/// Transactions are serialized through one async mutex. Each transaction
/// works on the live state and keeps a snapshot; rollback (or dropping the
/// transaction) restores it, so unique constraints and atomicity behave as
/// they do against Postgres.
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
    batch_faults: Arc<std::sync::Mutex<BatchFaults>>,
}

/// Injected `put_batch` failures. Lives outside [`CatalogState`] so a
/// rollback does not rewind it.
#[derive(Debug, Default)]
struct BatchFaults {
    skip: usize,
    fail: usize,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events, including soft-deleted ones (primarily for tests).
    pub async fn all_events(&self) -> Vec<Event> {
        self.state.lock().await.events.values().cloned().collect()
    }

    pub async fn all_places(&self) -> Vec<Place> {
        self.state.lock().await.places.values().cloned().collect()
    }

    pub async fn all_organizations(&self) -> Vec<Organization> {
        self.state
            .lock()
            .await
            .organizations
            .values()
            .cloned()
            .collect()
    }

    pub async fn all_review_entries(&self) -> Vec<ReviewEntry> {
        self.state.lock().await.reviews.values().cloned().collect()
    }

    pub async fn all_batches(&self) -> Vec<BatchStatus> {
        self.state.lock().await.batches.values().cloned().collect()
    }

    /// Let the next `skip` batch writes through, then fail `fail` of them.
    /// For exercising store outages in tests.
    pub fn fail_batch_writes(&self, skip: usize, fail: usize) {
        if let Ok(mut faults) = self.batch_faults.lock() {
            *faults = BatchFaults { skip, fail };
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn begin(&self) -> Result<Box<dyn CatalogTx>> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
            batch_faults: self.batch_faults.clone(),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<CatalogState>,
    snapshot: Option<CatalogState>,
    batch_faults: Arc<std::sync::Mutex<BatchFaults>>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

impl MemoryTx {
    fn check_event_unique(&self, event: &Event) -> Result<()> {
        if event.is_deleted() {
            return Ok(());
        }
        for other in self.guard.events.values() {
            if other.id == event.id || other.is_deleted() {
                continue;
            }
            if event.source.is_some() && other.source == event.source {
                return Err(Error::conflict("events_source_identity_idx"));
            }
            if event.fingerprint.is_some() && other.fingerprint == event.fingerprint {
                return Err(Error::conflict("events_fingerprint_idx"));
            }
            if event.federation_uri.is_some() && other.federation_uri == event.federation_uri {
                return Err(Error::conflict("events_federation_uri_idx"));
            }
        }
        Ok(())
    }

    fn find_event(&self, pred: impl Fn(&Event) -> bool) -> Option<Event> {
        self.guard
            .events
            .values()
            .find(|e| !e.is_deleted() && pred(e))
            .cloned()
    }
}

#[async_trait]
impl CatalogTx for MemoryTx {
    async fn get_event(&mut self, id: &str) -> Result<Option<Event>> {
        Ok(self.guard.events.get(id).cloned())
    }

    async fn find_event_by_source(&mut self, source: &SourceIdentity) -> Result<Option<Event>> {
        Ok(self.find_event(|e| e.source.as_ref() == Some(source)))
    }

    async fn find_event_by_fingerprint(&mut self, fingerprint: &str) -> Result<Option<Event>> {
        Ok(self.find_event(|e| e.fingerprint.as_deref() == Some(fingerprint)))
    }

    async fn find_event_by_federation_uri(&mut self, uri: &str) -> Result<Option<Event>> {
        Ok(self.find_event(|e| e.federation_uri.as_deref() == Some(uri)))
    }

    async fn insert_event(&mut self, event: &Event) -> Result<()> {
        if self.guard.events.contains_key(&event.id) {
            return Err(Error::conflict("events_pkey"));
        }
        self.check_event_unique(event)?;
        self.guard.events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn update_event(&mut self, event: &Event) -> Result<()> {
        if !self.guard.events.contains_key(&event.id) {
            return Err(Error::NotFound(format!("event {}", event.id)));
        }
        self.check_event_unique(event)?;
        self.guard.events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn upsert_place(&mut self, place: &Place) -> Result<Place> {
        let existing = self
            .guard
            .places
            .values_mut()
            .find(|p| p.deleted_at.is_none() && p.natural_key == place.natural_key);
        if let Some(existing) = existing {
            existing.fill_from(place);
            existing.updated_at = place.updated_at;
            return Ok(existing.clone());
        }
        self.guard.places.insert(place.id.clone(), place.clone());
        Ok(place.clone())
    }

    async fn get_place(&mut self, id: &str) -> Result<Option<Place>> {
        Ok(self.guard.places.get(id).cloned())
    }

    async fn find_place_by_federation_uri(&mut self, uri: &str) -> Result<Option<Place>> {
        Ok(self
            .guard
            .places
            .values()
            .find(|p| p.deleted_at.is_none() && p.federation_uri.as_deref() == Some(uri))
            .cloned())
    }

    async fn update_place(&mut self, place: &Place) -> Result<()> {
        match self.guard.places.get_mut(&place.id) {
            Some(slot) => {
                *slot = place.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("place {}", place.id))),
        }
    }

    async fn upsert_organization(&mut self, org: &Organization) -> Result<Organization> {
        let existing = self
            .guard
            .organizations
            .values_mut()
            .find(|o| o.deleted_at.is_none() && o.natural_key == org.natural_key);
        if let Some(existing) = existing {
            existing.fill_from(org);
            existing.updated_at = org.updated_at;
            return Ok(existing.clone());
        }
        self.guard.organizations.insert(org.id.clone(), org.clone());
        Ok(org.clone())
    }

    async fn get_organization(&mut self, id: &str) -> Result<Option<Organization>> {
        Ok(self.guard.organizations.get(id).cloned())
    }

    async fn find_organization_by_federation_uri(
        &mut self,
        uri: &str,
    ) -> Result<Option<Organization>> {
        Ok(self
            .guard
            .organizations
            .values()
            .find(|o| o.deleted_at.is_none() && o.federation_uri.as_deref() == Some(uri))
            .cloned())
    }

    async fn update_organization(&mut self, org: &Organization) -> Result<()> {
        match self.guard.organizations.get_mut(&org.id) {
            Some(slot) => {
                *slot = org.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("organization {}", org.id))),
        }
    }

    async fn insert_tombstone(&mut self, tombstone: &Tombstone) -> Result<()> {
        self.guard
            .tombstones
            .entry((tombstone.kind, tombstone.entity_id.clone()))
            .or_insert_with(|| tombstone.clone());
        Ok(())
    }

    async fn get_tombstone(&mut self, kind: EntityKind, id: &str) -> Result<Option<Tombstone>> {
        Ok(self.guard.tombstones.get(&(kind, id.to_string())).cloned())
    }

    async fn insert_idempotency_key(&mut self, key: &IdempotencyKey) -> Result<()> {
        if self.guard.idempotency.contains_key(&key.key) {
            return Err(Error::conflict("idempotency_keys_pkey"));
        }
        self.guard.idempotency.insert(key.key.clone(), key.clone());
        Ok(())
    }

    async fn get_idempotency_key(&mut self, key: &str) -> Result<Option<IdempotencyKey>> {
        Ok(self.guard.idempotency.get(key).cloned())
    }

    async fn complete_idempotency_key(&mut self, key: &str, event_id: &str) -> Result<()> {
        let Some(row) = self.guard.idempotency.get_mut(key) else {
            return Err(Error::NotFound(format!("idempotency key {key}")));
        };
        match row.event_id.as_deref() {
            None => {
                row.event_id = Some(event_id.to_string());
                Ok(())
            }
            Some(existing) if existing == event_id => Ok(()),
            Some(_) => Err(Error::conflict("idempotency_keys_event_id")),
        }
    }

    async fn delete_idempotency_key(&mut self, key: &str) -> Result<()> {
        self.guard.idempotency.remove(key);
        Ok(())
    }

    async fn purge_idempotency_keys(&mut self, now: DateTime<Utc>) -> Result<u64> {
        let before = self.guard.idempotency.len();
        self.guard.idempotency.retain(|_, k| !k.is_expired(now));
        Ok((before - self.guard.idempotency.len()) as u64)
    }

    async fn insert_review_entry(&mut self, entry: &ReviewEntry) -> Result<()> {
        if self.guard.reviews.contains_key(&entry.id) {
            return Err(Error::conflict("review_queue_pkey"));
        }
        self.guard.reviews.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn get_review_entry(&mut self, id: &str) -> Result<Option<ReviewEntry>> {
        Ok(self.guard.reviews.get(id).cloned())
    }

    async fn find_pending_review_for_event(
        &mut self,
        event_id: &str,
    ) -> Result<Option<ReviewEntry>> {
        Ok(self
            .guard
            .reviews
            .values()
            .find(|r| r.status == ReviewStatus::Pending && r.event_id == event_id)
            .cloned())
    }

    async fn find_rejected_review(
        &mut self,
        source: Option<&SourceIdentity>,
        fingerprint: Option<&str>,
    ) -> Result<Option<ReviewEntry>> {
        Ok(self
            .guard
            .reviews
            .values()
            .rev()
            .find(|r| {
                r.status == ReviewStatus::Rejected
                    && ((source.is_some() && r.source.as_ref() == source)
                        || (fingerprint.is_some() && r.fingerprint.as_deref() == fingerprint))
            })
            .cloned())
    }

    async fn transition_review(
        &mut self,
        id: &str,
        transition: &ReviewTransition,
    ) -> Result<Option<ReviewEntry>> {
        let Some(entry) = self.guard.reviews.get_mut(id) else {
            return Err(Error::NotFound(format!("review entry {id}")));
        };
        if entry.status != ReviewStatus::Pending {
            return Ok(None);
        }
        entry.apply(transition);
        Ok(Some(entry.clone()))
    }

    async fn refresh_pending_review(&mut self, entry: &ReviewEntry) -> Result<bool> {
        let Some(stored) = self.guard.reviews.get_mut(&entry.id) else {
            return Err(Error::NotFound(format!("review entry {}", entry.id)));
        };
        if stored.status != ReviewStatus::Pending {
            return Ok(false);
        }
        stored.original_payload = entry.original_payload.clone();
        stored.normalized_payload = entry.normalized_payload.clone();
        stored.warnings = entry.warnings.clone();
        stored.confidence = entry.confidence;
        stored.event_start = entry.event_start;
        stored.event_end = entry.event_end;
        stored.updated_at = entry.updated_at;
        Ok(true)
    }

    async fn list_review_entries(
        &mut self,
        status: Option<ReviewStatus>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ReviewEntry>> {
        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor.to_string()),
            None => Bound::Unbounded,
        };
        Ok(self
            .guard
            .reviews
            .range((lower, Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge_rejected_reviews(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.guard.reviews.len();
        self.guard
            .reviews
            .retain(|_, r| !(r.status == ReviewStatus::Rejected && r.event_over_at() < cutoff));
        Ok((before - self.guard.reviews.len()) as u64)
    }

    async fn get_node(&mut self, domain: &str) -> Result<Option<FederationNode>> {
        Ok(self.guard.nodes.get(domain).cloned())
    }

    async fn upsert_node(&mut self, node: &FederationNode) -> Result<()> {
        self.guard.nodes.insert(node.domain.clone(), node.clone());
        Ok(())
    }

    async fn put_batch(&mut self, batch: &BatchStatus) -> Result<()> {
        {
            let mut faults = self
                .batch_faults
                .lock()
                .map_err(|_| Error::message("batch fault injector poisoned"))?;
            if faults.skip > 0 {
                faults.skip -= 1;
            } else if faults.fail > 0 {
                faults.fail -= 1;
                return Err(Error::message("injected batch write failure"));
            }
        }
        self.guard.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn get_batch(&mut self, id: &str) -> Result<Option<BatchStatus>> {
        Ok(self.guard.batches.get(id).cloned())
    }

    async fn purge_batches(&mut self, completed_before: DateTime<Utc>) -> Result<u64> {
        let before = self.guard.batches.len();
        self.guard.batches.retain(|_, b| {
            !(b.state.is_terminal() && b.completed_at.is_some_and(|at| at < completed_before))
        });
        Ok((before - self.guard.batches.len()) as u64)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // Drop restores the snapshot.
        Ok(())
    }
}
