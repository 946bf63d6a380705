use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{
    BatchStatus, EntityKind, Event, FederationNode, IdempotencyKey, Organization, Place,
    ReviewEntry, ReviewStatus, ReviewTransition, SourceIdentity, Tombstone,
};
use super::Result;

/// Entry point to the catalog. All reads and writes happen inside a
/// [`CatalogTx`]; dropping a transaction without committing rolls it back.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn CatalogTx>>;

    /// Convenience read outside any caller transaction.
    async fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let mut tx = self.begin().await?;
        let event = tx.get_event(id).await?;
        tx.rollback().await?;
        Ok(event)
    }

    async fn get_review_entry(&self, id: &str) -> Result<Option<ReviewEntry>> {
        let mut tx = self.begin().await?;
        let entry = tx.get_review_entry(id).await?;
        tx.rollback().await?;
        Ok(entry)
    }

    async fn find_event_by_federation_uri(&self, uri: &str) -> Result<Option<Event>> {
        let mut tx = self.begin().await?;
        let event = tx.find_event_by_federation_uri(uri).await?;
        tx.rollback().await?;
        Ok(event)
    }
}

/// One unit of work against the catalog.
///
/// Unique constraints (non-deleted events per source identity, fingerprint
/// and federation URI; idempotency keys; place and organization natural
/// keys) surface as [`super::Error::Conflict`].
#[async_trait]
pub trait CatalogTx: Send {
    // Events. `get_event` includes soft-deleted rows; the `find_*` lookups don't.
    async fn get_event(&mut self, id: &str) -> Result<Option<Event>>;
    async fn find_event_by_source(&mut self, source: &SourceIdentity) -> Result<Option<Event>>;
    async fn find_event_by_fingerprint(&mut self, fingerprint: &str) -> Result<Option<Event>>;
    async fn find_event_by_federation_uri(&mut self, uri: &str) -> Result<Option<Event>>;
    async fn insert_event(&mut self, event: &Event) -> Result<()>;
    /// Replace the stored event and its occurrences.
    async fn update_event(&mut self, event: &Event) -> Result<()>;

    // Places and organizations, upserted by natural key.
    async fn upsert_place(&mut self, place: &Place) -> Result<Place>;
    async fn get_place(&mut self, id: &str) -> Result<Option<Place>>;
    async fn find_place_by_federation_uri(&mut self, uri: &str) -> Result<Option<Place>>;
    async fn update_place(&mut self, place: &Place) -> Result<()>;
    async fn upsert_organization(&mut self, org: &Organization) -> Result<Organization>;
    async fn get_organization(&mut self, id: &str) -> Result<Option<Organization>>;
    async fn find_organization_by_federation_uri(
        &mut self,
        uri: &str,
    ) -> Result<Option<Organization>>;
    async fn update_organization(&mut self, org: &Organization) -> Result<()>;

    async fn insert_tombstone(&mut self, tombstone: &Tombstone) -> Result<()>;
    async fn get_tombstone(&mut self, kind: EntityKind, id: &str) -> Result<Option<Tombstone>>;

    // Idempotency keys.
    async fn insert_idempotency_key(&mut self, key: &IdempotencyKey) -> Result<()>;
    async fn get_idempotency_key(&mut self, key: &str) -> Result<Option<IdempotencyKey>>;
    /// Set the produced event. Fails with `Conflict` if already completed
    /// with a different event, `NotFound` if the key is gone.
    async fn complete_idempotency_key(&mut self, key: &str, event_id: &str) -> Result<()>;
    async fn delete_idempotency_key(&mut self, key: &str) -> Result<()>;
    async fn purge_idempotency_keys(&mut self, now: DateTime<Utc>) -> Result<u64>;

    // Review queue.
    async fn insert_review_entry(&mut self, entry: &ReviewEntry) -> Result<()>;
    async fn get_review_entry(&mut self, id: &str) -> Result<Option<ReviewEntry>>;
    async fn find_pending_review_for_event(&mut self, event_id: &str)
        -> Result<Option<ReviewEntry>>;
    /// Most recent rejected entry matching the source identity or fingerprint.
    async fn find_rejected_review(
        &mut self,
        source: Option<&SourceIdentity>,
        fingerprint: Option<&str>,
    ) -> Result<Option<ReviewEntry>>;
    /// Conditional write: applies only while the entry is still pending.
    /// Returns `None` when the entry exists but was already decided.
    async fn transition_review(
        &mut self,
        id: &str,
        transition: &ReviewTransition,
    ) -> Result<Option<ReviewEntry>>;
    /// Replace the submitted payloads, warnings, confidence and event window
    /// of an entry that is still pending. Returns `false` when it was
    /// already decided.
    async fn refresh_pending_review(&mut self, entry: &ReviewEntry) -> Result<bool>;
    /// Oldest first, strictly after `after` when given.
    async fn list_review_entries(
        &mut self,
        status: Option<ReviewStatus>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ReviewEntry>>;
    /// Delete rejected entries whose event was over before `cutoff`.
    async fn purge_rejected_reviews(&mut self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn get_node(&mut self, domain: &str) -> Result<Option<FederationNode>>;
    async fn upsert_node(&mut self, node: &FederationNode) -> Result<()>;

    async fn put_batch(&mut self, batch: &BatchStatus) -> Result<()>;
    async fn get_batch(&mut self, id: &str) -> Result<Option<BatchStatus>>;
    async fn purge_batches(&mut self, completed_before: DateTime<Utc>) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}
