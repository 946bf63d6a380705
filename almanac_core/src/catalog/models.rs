use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Draft,
    Published,
    Postponed,
    Rescheduled,
    SoldOut,
    Cancelled,
    Completed,
    Deleted,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Postponed => "postponed",
            Self::Rescheduled => "rescheduled",
            Self::SoldOut => "sold_out",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "draft" => Self::Draft,
            "published" => Self::Published,
            "postponed" => Self::Postponed,
            "rescheduled" => Self::Rescheduled,
            "sold_out" => Self::SoldOut,
            "cancelled" => Self::Cancelled,
            "completed" => Self::Completed,
            "deleted" => Self::Deleted,
            other => return Err(Error::message(format!("unknown lifecycle state: {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceMode {
    #[default]
    Offline,
    Online,
    Mixed,
}

impl AttendanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "offline" => Self::Offline,
            "online" => Self::Online,
            "mixed" => Self::Mixed,
            other => return Err(Error::message(format!("unknown attendance mode: {other}"))),
        })
    }

    pub fn from_locations(has_venue: bool, has_virtual: bool) -> Self {
        match (has_venue, has_virtual) {
            (true, true) => Self::Mixed,
            (false, true) => Self::Online,
            _ => Self::Offline,
        }
    }
}

/// The submitting source's own identity for an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceIdentity {
    /// Normalized source URL, or source name when no URL was given.
    pub key: String,
    pub external_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    MissingDescription,
    MissingImage,
    MissingLocation,
    AmbiguousVenue,
    TooFarFuture,
    ReversedDates,
    ReversedDatesTimezoneLikely,
    ReversedDatesCorrectedNeedsReview,
    LowConfidence,
}

impl WarningCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingDescription => "missing_description",
            Self::MissingImage => "missing_image",
            Self::MissingLocation => "missing_location",
            Self::AmbiguousVenue => "ambiguous_venue",
            Self::TooFarFuture => "too_far_future",
            Self::ReversedDates => "reversed_dates",
            Self::ReversedDatesTimezoneLikely => "reversed_dates_timezone_likely",
            Self::ReversedDatesCorrectedNeedsReview => "reversed_dates_corrected_needs_review",
            Self::LowConfidence => "low_confidence",
        }
    }

    /// Date problems lower confidence less than missing data.
    pub fn is_date_flag(&self) -> bool {
        matches!(
            self,
            Self::ReversedDates
                | Self::ReversedDatesTimezoneLikely
                | Self::ReversedDatesCorrectedNeedsReview
        )
    }
}

impl fmt::Display for WarningCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured finding about a submission that routes it to review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub field: String,
    pub code: WarningCode,
    pub message: String,
}

impl Warning {
    pub fn new(field: impl Into<String>, code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: String,
    pub event_id: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub door_time: Option<DateTime<Utc>>,
    pub timezone: String,
    pub venue_id: Option<String>,
    pub virtual_url: Option<String>,
    pub ticket_url: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub currency: Option<String>,
}

/// A catalog event. Occurrences are stored alongside and always loaded with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// ULID.
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub keywords: Vec<String>,
    pub in_language: Vec<String>,
    pub is_accessible_for_free: Option<bool>,
    pub attendance_mode: AttendanceMode,
    /// schema.org eventStatus as sent by a peer, if any.
    pub event_status: Option<String>,
    pub license_url: String,
    pub lifecycle: LifecycleState,
    pub confidence: Option<f64>,
    pub organizer_id: Option<String>,
    pub venue_id: Option<String>,
    pub virtual_url: Option<String>,
    pub source: Option<SourceIdentity>,
    pub fingerprint: Option<String>,
    /// Peer identifier, only for events synced from another node.
    pub federation_uri: Option<String>,
    pub origin_node: Option<String>,
    /// Unrecognized federation fields, kept for round-tripping.
    pub extensions: serde_json::Map<String, serde_json::Value>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deletion_reason: Option<String>,
    pub merged_into: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub occurrences: Vec<Occurrence>,
}

pub const CC0_LICENSE: &str = "https://creativecommons.org/publicdomain/zero/1.0/";

impl Event {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The earliest occurrence, used for summaries.
    pub fn summary_occurrence(&self) -> Option<&Occurrence> {
        self.occurrences.iter().min_by_key(|o| o.start)
    }

    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        self.summary_occurrence().map(|o| o.start)
    }

    pub fn canonical_uri(&self, node_domain: &str) -> String {
        match &self.federation_uri {
            Some(uri) => uri.clone(),
            None => format!("https://{node_domain}/events/{}", self.id),
        }
    }

    /// The public view kept in a tombstone.
    pub fn public_snapshot(&self, node_domain: &str) -> serde_json::Value {
        let occ = self.summary_occurrence();
        json!({
            "@id": self.canonical_uri(node_domain),
            "@type": "Event",
            "name": self.name,
            "description": self.description,
            "url": self.url,
            "image": self.image_url,
            "startDate": occ.map(|o| o.start),
            "endDate": occ.and_then(|o| o.end),
            "keywords": self.keywords,
            "inLanguage": self.in_language,
            "license": self.license_url,
        })
    }

    /// Soft delete. The row stays so tombstones and merges can point at it.
    pub fn mark_deleted(&mut self, reason: &str, merged_into: Option<String>, now: DateTime<Utc>) {
        self.lifecycle = LifecycleState::Deleted;
        self.deleted_at = Some(now);
        self.deletion_reason = Some(reason.to_string());
        self.merged_into = merged_into;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: String,
    pub name: String,
    pub street_address: Option<String>,
    pub locality: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub federation_uri: Option<String>,
    /// Normalized name + address; unique among non-deleted places.
    pub natural_key: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Place {
    /// Fill fields this record lacks from `other`. Never overwrites.
    pub fn fill_from(&mut self, other: &Place) {
        fill(&mut self.street_address, &other.street_address);
        fill(&mut self.locality, &other.locality);
        fill(&mut self.region, &other.region);
        fill(&mut self.postal_code, &other.postal_code);
        fill(&mut self.country, &other.country);
        fill(&mut self.federation_uri, &other.federation_uri);
        if self.latitude.is_none() && self.longitude.is_none() {
            self.latitude = other.latitude;
            self.longitude = other.longitude;
        }
    }

    pub fn public_snapshot(&self) -> serde_json::Value {
        json!({
            "@type": "Place",
            "name": self.name,
            "address": {
                "streetAddress": self.street_address,
                "addressLocality": self.locality,
                "addressRegion": self.region,
                "postalCode": self.postal_code,
                "addressCountry": self.country,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub url: Option<String>,
    pub email: Option<String>,
    pub locality: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub federation_uri: Option<String>,
    /// Normalized name + URL host; unique among non-deleted organizations.
    pub natural_key: String,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn fill_from(&mut self, other: &Organization) {
        fill(&mut self.url, &other.url);
        fill(&mut self.email, &other.email);
        fill(&mut self.locality, &other.locality);
        fill(&mut self.region, &other.region);
        fill(&mut self.country, &other.country);
        fill(&mut self.federation_uri, &other.federation_uri);
    }

    pub fn public_snapshot(&self) -> serde_json::Value {
        json!({
            "@type": "Organization",
            "name": self.name,
            "url": self.url,
        })
    }
}

fn fill(slot: &mut Option<String>, other: &Option<String>) {
    if slot.as_deref().map_or(true, |s| s.trim().is_empty()) {
        if let Some(v) = other.as_deref().filter(|v| !v.trim().is_empty()) {
            *slot = Some(v.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub key: String,
    /// SHA-256 of the canonical request body.
    pub request_hash: String,
    /// Set exactly once, when the guarded request produced an event.
    pub event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyKey {
    pub fn new(key: &str, request_hash: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            event_id: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => Self::Pending,
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            other => return Err(Error::message(format!("unknown review status: {other}"))),
        })
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewEntry {
    /// ULID; FIFO order.
    pub id: String,
    pub event_id: String,
    pub original_payload: serde_json::Value,
    pub normalized_payload: serde_json::Value,
    pub warnings: Vec<Warning>,
    pub confidence: f64,
    pub source: Option<SourceIdentity>,
    pub fingerprint: Option<String>,
    pub event_start: DateTime<Utc>,
    pub event_end: Option<DateTime<Utc>>,
    pub status: ReviewStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A terminal decision applied to a pending entry by a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewTransition {
    pub status: ReviewStatus,
    pub reviewed_by: String,
    pub reviewed_at: DateTime<Utc>,
    pub review_notes: Option<String>,
    pub rejection_reason: Option<String>,
}

impl ReviewEntry {
    pub fn apply(&mut self, t: &ReviewTransition) {
        self.status = t.status;
        self.reviewed_by = Some(t.reviewed_by.clone());
        self.reviewed_at = Some(t.reviewed_at);
        self.review_notes = t.review_notes.clone();
        self.rejection_reason = t.rejection_reason.clone();
        self.updated_at = t.reviewed_at;
    }

    /// When the reviewed event is over; rejection memory expires relative to it.
    pub fn event_over_at(&self) -> DateTime<Utc> {
        self.event_end.unwrap_or(self.event_start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Event,
    Place,
    Organization,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Place => "place",
            Self::Organization => "organization",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "event" => Self::Event,
            "place" => Self::Place,
            "organization" => Self::Organization,
            other => return Err(Error::message(format!("unknown entity kind: {other}"))),
        })
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of a soft-deleted entity's last public state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub kind: EntityKind,
    pub entity_id: String,
    pub uri: String,
    pub deleted_at: DateTime<Utc>,
    pub reason: String,
    pub superseded_by: Option<String>,
    pub snapshot: serde_json::Value,
}

impl Tombstone {
    pub fn for_event(
        event: &Event,
        node_domain: &str,
        reason: &str,
        superseded_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let uri = event.canonical_uri(node_domain);
        let mut snapshot = event.public_snapshot(node_domain);
        if let Some(obj) = snapshot.as_object_mut() {
            obj.insert("eventStatus".into(), json!("https://schema.org/EventCancelled"));
            obj.insert("deletedAt".into(), json!(now));
            obj.insert("deletionReason".into(), json!(reason));
            if let Some(next) = &superseded_by {
                obj.insert("supersededBy".into(), json!(next));
            }
        }
        Self {
            kind: EntityKind::Event,
            entity_id: event.id.clone(),
            uri,
            deleted_at: now,
            reason: reason.to_string(),
            superseded_by,
            snapshot,
        }
    }

    pub fn for_place(place: &Place, node_domain: &str, reason: &str, now: DateTime<Utc>) -> Self {
        let uri = place
            .federation_uri
            .clone()
            .unwrap_or_else(|| format!("https://{node_domain}/places/{}", place.id));
        Self::plain(EntityKind::Place, &place.id, uri, place.public_snapshot(), reason, now)
    }

    pub fn for_organization(
        org: &Organization,
        node_domain: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let uri = org
            .federation_uri
            .clone()
            .unwrap_or_else(|| format!("https://{node_domain}/organizations/{}", org.id));
        Self::plain(EntityKind::Organization, &org.id, uri, org.public_snapshot(), reason, now)
    }

    fn plain(
        kind: EntityKind,
        id: &str,
        uri: String,
        mut snapshot: serde_json::Value,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        if let Some(obj) = snapshot.as_object_mut() {
            obj.insert("@id".into(), json!(uri));
            obj.insert("deletedAt".into(), json!(now));
            obj.insert("deletionReason".into(), json!(reason));
        }
        Self {
            kind,
            entity_id: id.to_string(),
            uri,
            deleted_at: now,
            reason: reason.to_string(),
            superseded_by: None,
            snapshot,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationNode {
    pub domain: String,
    pub name: String,
    pub base_url: String,
    pub trust_level: i32,
    pub sync_enabled: bool,
    pub is_online: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    Processing,
    Completed,
    /// The worker stopped before finishing; `error` says why.
    Failed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// No further progress will be recorded.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "queued" => Self::Queued,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => return Err(Error::message(format!("unknown batch state: {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemOutcome {
    Created,
    Duplicate,
    NeedsReview,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub outcome: BatchItemOutcome,
    pub event_id: Option<String>,
    pub error: Option<String>,
}

/// Persisted progress of an asynchronous batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub id: String,
    pub state: BatchState,
    pub total: usize,
    pub created: usize,
    pub duplicates: usize,
    pub needs_review: usize,
    pub failed: usize,
    pub results: Vec<BatchItemResult>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchStatus {
    pub fn queued(id: String, total: usize, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: BatchState::Queued,
            total,
            created: 0,
            duplicates: 0,
            needs_review: 0,
            failed: 0,
            results: Vec::with_capacity(total),
            submitted_at: now,
            completed_at: None,
            error: None,
        }
    }

    pub fn record(&mut self, result: BatchItemResult) {
        match result.outcome {
            BatchItemOutcome::Created => self.created += 1,
            BatchItemOutcome::Duplicate => self.duplicates += 1,
            BatchItemOutcome::NeedsReview => self.needs_review += 1,
            BatchItemOutcome::Failed => self.failed += 1,
        }
        self.results.push(result);
    }

    pub fn processed(&self) -> usize {
        self.results.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> Event {
        let now = Utc::now();
        Event {
            id: id.to_string(),
            name: "Jazz Night".into(),
            description: None,
            url: None,
            image_url: None,
            keywords: vec![],
            in_language: vec![],
            is_accessible_for_free: None,
            attendance_mode: AttendanceMode::Offline,
            event_status: None,
            license_url: CC0_LICENSE.into(),
            lifecycle: LifecycleState::Published,
            confidence: None,
            organizer_id: None,
            venue_id: None,
            virtual_url: None,
            source: None,
            fingerprint: None,
            federation_uri: None,
            origin_node: None,
            extensions: Default::default(),
            deleted_at: None,
            deletion_reason: None,
            merged_into: None,
            created_at: now,
            updated_at: now,
            occurrences: vec![],
        }
    }

    #[test]
    fn canonical_uri_prefers_federation_uri() {
        let mut e = event("01J");
        assert_eq!(e.canonical_uri("cal.example"), "https://cal.example/events/01J");
        e.federation_uri = Some("https://peer.example/events/E1".into());
        assert_eq!(e.canonical_uri("cal.example"), "https://peer.example/events/E1");
    }

    #[test]
    fn tombstone_snapshot_carries_deletion_fields() {
        let e = event("01J");
        let t = Tombstone::for_event(&e, "cal.example", "spam", Some("https://x/1".into()), Utc::now());
        assert_eq!(t.snapshot["deletionReason"], "spam");
        assert_eq!(t.snapshot["supersededBy"], "https://x/1");
        assert_eq!(t.snapshot["@id"], "https://cal.example/events/01J");
        assert_eq!(t.kind, EntityKind::Event);
    }

    #[test]
    fn place_fill_never_overwrites() {
        let now = Utc::now();
        let mut a = Place {
            id: "p1".into(),
            name: "Rex".into(),
            street_address: Some("1 Main".into()),
            locality: None,
            region: None,
            postal_code: None,
            country: None,
            latitude: None,
            longitude: None,
            federation_uri: None,
            natural_key: "rex".into(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut b = a.clone();
        b.street_address = Some("2 Other".into());
        b.locality = Some("Toronto".into());
        a.fill_from(&b);
        assert_eq!(a.street_address.as_deref(), Some("1 Main"));
        assert_eq!(a.locality.as_deref(), Some("Toronto"));
    }

    #[test]
    fn batch_counts_follow_outcomes() {
        let mut b = BatchStatus::queued("b1".into(), 2, Utc::now());
        b.record(BatchItemResult {
            index: 0,
            outcome: BatchItemOutcome::Created,
            event_id: Some("e".into()),
            error: None,
        });
        b.record(BatchItemResult {
            index: 1,
            outcome: BatchItemOutcome::Failed,
            event_id: None,
            error: Some("bad".into()),
        });
        assert_eq!((b.created, b.failed, b.processed()), (1, 1, 2));
    }
}
