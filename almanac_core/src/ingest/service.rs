use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use ulid::Ulid;

use super::{Error, Result};
use crate::candidate::{prepare, CandidateEvent, NormalizedCandidate};
use crate::catalog::identity::{resolve_organization, resolve_place};
use crate::catalog::models::{
    AttendanceMode, Event, LifecycleState, Occurrence, ReviewEntry, ReviewStatus, Warning,
};
use crate::catalog::{CatalogStore, CatalogTx};
use crate::config::{IngestConfig, ValidationConfig};
use crate::dedup::{self, Assessment, Classification};
use crate::idempotency::{request_hash, Begin, Claim, IdempotencyCoordinator};
use crate::models::RequestContext;
use crate::review::transitions;

/// Reviewer recorded when a resubmission clears its own pending review.
pub const AUTO_REVIEWER: &str = "system";

/// Concurrent-writer conflicts are re-resolved this many times before
/// giving up.
const MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestOptions {
    /// Keep accepted events in `draft` instead of publishing them.
    pub stage_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestResult {
    pub event: Event,
    pub is_duplicate: bool,
    pub needs_review: bool,
    pub warnings: Vec<Warning>,
    pub review_entry_id: Option<String>,
    /// Answered from a completed idempotency key without redoing the work.
    pub replayed: bool,
}

#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn CatalogStore>,
    idempotency: IdempotencyCoordinator,
    validation: ValidationConfig,
    cfg: IngestConfig,
}

enum Attempt {
    Done(IngestResult),
    Raced(String),
}

impl IngestService {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        idempotency: IdempotencyCoordinator,
        validation: ValidationConfig,
        cfg: IngestConfig,
    ) -> Self {
        Self {
            store,
            idempotency,
            validation,
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub fn config(&self) -> &IngestConfig {
        &self.cfg
    }

    pub fn validation(&self) -> &ValidationConfig {
        &self.validation
    }

    /// Validate, deduplicate and route one candidate.
    #[tracing::instrument(level = "debug", skip_all, fields(request_id = %ctx.request_id))]
    pub async fn ingest(
        &self,
        ctx: &RequestContext,
        candidate: &CandidateEvent,
        options: IngestOptions,
    ) -> Result<IngestResult> {
        let normalized = prepare(candidate, &self.cfg.default_timezone)?;
        self.run(ctx, candidate, &normalized, options, None).await
    }

    /// [`Self::ingest`] guarded by an idempotency token: retries with the same
    /// token and body return the first result instead of writing again.
    #[tracing::instrument(level = "debug", skip_all, fields(request_id = %ctx.request_id, key = %token))]
    pub async fn ingest_with_idempotency(
        &self,
        ctx: &RequestContext,
        candidate: &CandidateEvent,
        token: &str,
        options: IngestOptions,
    ) -> Result<IngestResult> {
        let normalized = prepare(candidate, &self.cfg.default_timezone)?;
        let hash = request_hash(candidate)?;

        let claim = match self.idempotency.begin(ctx, token, &hash).await? {
            Begin::AlreadyCompleted(event_id) => return self.replay(ctx, &event_id).await,
            Begin::ProceedExclusive(claim) => claim,
        };

        match self
            .run(ctx, candidate, &normalized, options, Some(&claim))
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                if let Err(release) = self.idempotency.abandon(ctx, &claim).await {
                    tracing::warn!(key = %token, error = %release, "failed releasing idempotency key");
                }
                Err(err)
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(event_id = %event_id))]
    async fn replay(&self, ctx: &RequestContext, event_id: &str) -> Result<IngestResult> {
        let mut tx = ctx.bound(self.store.begin()).await?;
        let event = ctx
            .bound(tx.get_event(event_id))
            .await?
            .ok_or_else(|| crate::catalog::Error::NotFound(format!("event {event_id}")))?;
        let pending = ctx.bound(tx.find_pending_review_for_event(event_id)).await?;
        tx.rollback().await?;

        // Nothing is created on replay.
        Ok(IngestResult {
            event,
            is_duplicate: true,
            needs_review: pending.is_some(),
            warnings: pending
                .as_ref()
                .map(|e| e.warnings.clone())
                .unwrap_or_default(),
            review_entry_id: pending.map(|e| e.id),
            replayed: true,
        })
    }

    async fn run(
        &self,
        ctx: &RequestContext,
        candidate: &CandidateEvent,
        normalized: &NormalizedCandidate,
        options: IngestOptions,
        claim: Option<&Claim>,
    ) -> Result<IngestResult> {
        let now = Utc::now();
        let assessment = dedup::assess(normalized, &self.validation, now);
        let fingerprint = dedup::candidate_fingerprint(normalized);

        let mut last_constraint = String::new();
        for attempt in 0..MAX_WRITE_ATTEMPTS {
            match self
                .attempt(ctx, candidate, normalized, &assessment, &fingerprint, options, claim, now)
                .await?
            {
                Attempt::Done(result) => return Ok(result),
                Attempt::Raced(constraint) => {
                    tracing::debug!(attempt, constraint = %constraint, "lost write race; re-resolving");
                    last_constraint = constraint;
                }
            }
        }
        Err(Error::Conflict {
            constraint: last_constraint,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        ctx: &RequestContext,
        candidate: &CandidateEvent,
        normalized: &NormalizedCandidate,
        assessment: &Assessment,
        fingerprint: &str,
        options: IngestOptions,
        claim: Option<&Claim>,
        now: DateTime<Utc>,
    ) -> Result<Attempt> {
        let mut tx = ctx.bound(self.store.begin()).await?;

        let source_match = match &normalized.source {
            Some(source) => ctx.bound(tx.find_event_by_source(source)).await?,
            None => None,
        };
        let fingerprint_match = match source_match {
            Some(_) => None,
            None => ctx.bound(tx.find_event_by_fingerprint(fingerprint)).await?,
        };

        let rejected = ctx
            .bound(tx.find_rejected_review(normalized.source.as_ref(), Some(fingerprint)))
            .await?;
        if let Some(rejected) = rejected {
            if dedup::warning_codes(&rejected.warnings) == assessment.codes() {
                tx.rollback().await?;
                tracing::info!(entry_id = %rejected.id, "submission matches a rejected review");
                return Err(Error::PreviouslyRejected {
                    entry_id: rejected.id,
                    reviewer: rejected.reviewed_by.unwrap_or_default(),
                    reviewed_at: rejected.reviewed_at.unwrap_or(rejected.updated_at),
                    reason: rejected.rejection_reason.unwrap_or_default(),
                });
            }
        }

        let classification = dedup::classify(
            source_match.as_ref(),
            fingerprint_match.as_ref(),
            assessment,
            &self.validation,
        );
        let result = match classification {
            Classification::DuplicateOf(_) => {
                let existing = source_match.or(fingerprint_match).ok_or_else(|| {
                    crate::catalog::Error::message("duplicate classification without a match")
                })?;
                self.resolve_duplicate(
                    ctx,
                    tx.as_mut(),
                    existing,
                    candidate,
                    normalized,
                    assessment,
                    now,
                )
                .await?
            }
            Classification::NeedsReview {
                warnings,
                confidence,
            } => {
                let event = self
                    .build_event(
                        ctx,
                        tx.as_mut(),
                        normalized,
                        fingerprint,
                        LifecycleState::Draft,
                        confidence,
                        now,
                    )
                    .await?;
                if let Some(constraint) = raced(ctx.bound(tx.insert_event(&event)).await)? {
                    return Ok(Attempt::Raced(constraint));
                }
                let entry = ReviewEntry {
                    id: Ulid::new().to_string(),
                    event_id: event.id.clone(),
                    original_payload: serde_json::to_value(candidate)?,
                    normalized_payload: serde_json::to_value(normalized)?,
                    warnings: warnings.clone(),
                    confidence,
                    source: normalized.source.clone(),
                    fingerprint: Some(fingerprint.to_string()),
                    event_start: normalized.start,
                    event_end: normalized.end.filter(|end| *end >= normalized.start),
                    status: ReviewStatus::Pending,
                    reviewed_by: None,
                    reviewed_at: None,
                    review_notes: None,
                    rejection_reason: None,
                    created_at: now,
                    updated_at: now,
                };
                ctx.bound(tx.insert_review_entry(&entry)).await?;
                tracing::info!(event_id = %event.id, entry_id = %entry.id, confidence, "event queued for review");
                IngestResult {
                    event,
                    is_duplicate: false,
                    needs_review: true,
                    warnings,
                    review_entry_id: Some(entry.id),
                    replayed: false,
                }
            }
            Classification::NewEvent => {
                let lifecycle = if options.stage_only {
                    LifecycleState::Draft
                } else {
                    LifecycleState::Published
                };
                let event = self
                    .build_event(
                        ctx,
                        tx.as_mut(),
                        normalized,
                        fingerprint,
                        lifecycle,
                        assessment.confidence,
                        now,
                    )
                    .await?;
                if let Some(constraint) = raced(ctx.bound(tx.insert_event(&event)).await)? {
                    return Ok(Attempt::Raced(constraint));
                }
                tracing::info!(event_id = %event.id, lifecycle = lifecycle.as_str(), "event created");
                IngestResult {
                    event,
                    is_duplicate: false,
                    needs_review: false,
                    warnings: assessment.warnings.clone(),
                    review_entry_id: None,
                    replayed: false,
                }
            }
        };

        if let Some(claim) = claim {
            self.idempotency
                .complete_in(tx.as_mut(), claim, &result.event.id)
                .await?;
        }
        if let Some(constraint) = raced(ctx.bound(tx.commit()).await)? {
            return Ok(Attempt::Raced(constraint));
        }
        Ok(Attempt::Done(result))
    }

    /// A duplicate never writes, except when the existing event is a draft
    /// still waiting in the review queue. A clean resubmission approves it
    /// and fills the gaps the first submission left; one that still carries
    /// warnings replaces what the moderators will see.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_duplicate(
        &self,
        ctx: &RequestContext,
        tx: &mut dyn CatalogTx,
        mut existing: Event,
        candidate: &CandidateEvent,
        normalized: &NormalizedCandidate,
        assessment: &Assessment,
        now: DateTime<Utc>,
    ) -> Result<IngestResult> {
        let pending = match existing.lifecycle {
            LifecycleState::Draft => ctx.bound(tx.find_pending_review_for_event(&existing.id)).await?,
            _ => None,
        };
        let mut review_entry_id = None;

        if let Some(mut entry) = pending {
            if assessment.warnings.is_empty() {
                let note = "resubmission passed validation";
                if let Ok(transition) = transitions::approve(&entry, AUTO_REVIEWER, Some(note), now)
                {
                    if ctx.bound(tx.transition_review(&entry.id, &transition)).await?.is_some() {
                        fill_event_gaps(&mut existing, normalized);
                        existing.lifecycle = LifecycleState::Published;
                        existing.confidence = Some(assessment.confidence);
                        existing.updated_at = now;
                        ctx.bound(tx.update_event(&existing)).await?;
                        tracing::info!(event_id = %existing.id, entry_id = %entry.id, "pending review auto-approved");
                    }
                }
            } else {
                entry.original_payload = serde_json::to_value(candidate)?;
                entry.normalized_payload = serde_json::to_value(normalized)?;
                entry.warnings = assessment.warnings.clone();
                entry.confidence = assessment.confidence;
                entry.event_start = normalized.start;
                entry.event_end = normalized.end.filter(|end| *end >= normalized.start);
                entry.updated_at = now;
                if ctx.bound(tx.refresh_pending_review(&entry)).await? {
                    tracing::info!(event_id = %existing.id, entry_id = %entry.id, "pending review refreshed");
                    review_entry_id = Some(entry.id);
                }
            }
        }

        tracing::debug!(event_id = %existing.id, "duplicate submission");
        Ok(IngestResult {
            event: existing,
            is_duplicate: true,
            needs_review: review_entry_id.is_some(),
            warnings: assessment.warnings.clone(),
            review_entry_id,
            replayed: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_event(
        &self,
        ctx: &RequestContext,
        tx: &mut dyn CatalogTx,
        normalized: &NormalizedCandidate,
        fingerprint: &str,
        lifecycle: LifecycleState,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<Event> {
        let venue = match &normalized.venue {
            Some(place) => Some(ctx.bound(resolve_place(tx, place, now)).await?),
            None => None,
        };
        let organizer = match &normalized.organizer {
            Some(org) => Some(ctx.bound(resolve_organization(tx, org, now)).await?),
            None => None,
        };

        let id = Ulid::new().to_string();
        let venue_id = venue.map(|p| p.id);
        let occurrences = normalized
            .slots()
            .into_iter()
            .map(|slot| Occurrence {
                id: Ulid::new().to_string(),
                event_id: id.clone(),
                start: slot.start,
                end: slot.end,
                door_time: slot.door_time,
                timezone: slot.timezone,
                venue_id: venue_id.clone(),
                virtual_url: slot.virtual_url,
                ticket_url: normalized.ticket_url.clone(),
                price_min: normalized.price,
                price_max: normalized.price,
                currency: normalized.currency.clone(),
            })
            .collect();

        Ok(Event {
            id,
            name: normalized.name.clone(),
            description: normalized.description.clone(),
            url: normalized.url.clone(),
            image_url: normalized.image.clone(),
            keywords: normalized.keywords.clone(),
            in_language: normalized.in_language.clone(),
            is_accessible_for_free: normalized.is_accessible_for_free,
            attendance_mode: AttendanceMode::from_locations(
                venue_id.is_some(),
                normalized.virtual_url.is_some(),
            ),
            event_status: None,
            license_url: normalized.license_url.clone(),
            lifecycle,
            confidence: Some(confidence),
            organizer_id: organizer.map(|o| o.id),
            venue_id,
            virtual_url: normalized.virtual_url.clone(),
            source: normalized.source.clone(),
            fingerprint: Some(fingerprint.to_string()),
            federation_uri: None,
            origin_node: None,
            extensions: serde_json::Map::new(),
            deleted_at: None,
            deletion_reason: None,
            merged_into: None,
            created_at: now,
            updated_at: now,
            occurrences,
        })
    }
}

/// Split a unique-constraint conflict (a concurrent writer won) from other
/// failures.
fn raced(res: crate::catalog::Result<()>) -> Result<Option<String>> {
    match res {
        Ok(()) => Ok(None),
        Err(crate::catalog::Error::Conflict { constraint }) => Ok(Some(constraint)),
        Err(e) => Err(e.into()),
    }
}

fn fill_event_gaps(event: &mut Event, normalized: &NormalizedCandidate) {
    fn fill(slot: &mut Option<String>, value: &Option<String>) {
        if slot.is_none() {
            slot.clone_from(value);
        }
    }
    fill(&mut event.description, &normalized.description);
    fill(&mut event.image_url, &normalized.image);
    fill(&mut event.url, &normalized.url);
    if event.keywords.is_empty() {
        event.keywords = normalized.keywords.clone();
    }
    if let Some(occ) = event.occurrences.iter_mut().min_by_key(|o| o.start) {
        if occ.end.is_none() {
            occ.end = normalized.end.filter(|end| *end >= occ.start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{PlaceInput, SourceInput};
    use crate::catalog::models::WarningCode;
    use crate::catalog::MemoryCatalog;
    use crate::config::IdempotencyConfig;

    fn service(store: &MemoryCatalog, validation: ValidationConfig) -> IngestService {
        let store: Arc<dyn CatalogStore> = Arc::new(store.clone());
        IngestService::new(
            store.clone(),
            IdempotencyCoordinator::new(store, IdempotencyConfig::default()),
            validation,
            IngestConfig::default(),
        )
    }

    fn ctx() -> RequestContext {
        RequestContext::system("test")
    }

    fn jazz() -> CandidateEvent {
        CandidateEvent {
            name: "Jazz Night".into(),
            description: Some("Live quartet".into()),
            start_date: "2026-07-10T19:00:00Z".into(),
            location: Some(PlaceInput {
                name: "The Rex".into(),
                street_address: Some("194 Queen St W".into()),
                ..PlaceInput::default()
            }),
            source: Some(SourceInput {
                name: Some("scraperA".into()),
                event_id: Some("evt-1".into()),
                ..SourceInput::default()
            }),
            ..CandidateEvent::default()
        }
    }

    #[tokio::test]
    async fn clean_candidate_is_published() {
        let store = MemoryCatalog::new();
        let svc = service(&store, ValidationConfig::default());
        let res = svc.ingest(&ctx(), &jazz(), IngestOptions::default()).await.unwrap();
        assert!(!res.is_duplicate && !res.needs_review);
        assert_eq!(res.event.lifecycle, LifecycleState::Published);
        assert_eq!(res.event.occurrences.len(), 1);
        assert!(res.event.venue_id.is_some());
        assert_eq!(store.all_places().await.len(), 1);
    }

    #[tokio::test]
    async fn staged_candidate_stays_draft() {
        let store = MemoryCatalog::new();
        let svc = service(&store, ValidationConfig::default());
        let res = svc
            .ingest(&ctx(), &jazz(), IngestOptions { stage_only: true })
            .await
            .unwrap();
        assert_eq!(res.event.lifecycle, LifecycleState::Draft);
        assert!(store.all_review_entries().await.is_empty());
    }

    #[tokio::test]
    async fn validation_failure_writes_nothing() {
        let store = MemoryCatalog::new();
        let svc = service(&store, ValidationConfig::default());
        let bad = CandidateEvent {
            start_date: "soon".into(),
            ..jazz()
        };
        let err = svc.ingest(&ctx(), &bad, IngestOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "startDate"));
        assert!(store.all_events().await.is_empty());
        assert!(store.all_places().await.is_empty());
    }

    #[tokio::test]
    async fn clean_resubmission_approves_pending_draft() {
        let store = MemoryCatalog::new();
        let svc = service(&store, ValidationConfig::default());
        let first = svc
            .ingest(
                &ctx(),
                &CandidateEvent {
                    description: None,
                    ..jazz()
                },
                IngestOptions::default(),
            )
            .await
            .unwrap();
        assert!(first.needs_review);
        assert_eq!(first.warnings[0].code, WarningCode::MissingDescription);

        let second = svc.ingest(&ctx(), &jazz(), IngestOptions::default()).await.unwrap();
        assert!(second.is_duplicate);
        assert_eq!(second.event.id, first.event.id);
        assert_eq!(second.event.lifecycle, LifecycleState::Published);
        assert_eq!(second.event.description.as_deref(), Some("Live quartet"));

        let entries = store.all_review_entries().await;
        assert_eq!(entries[0].status, ReviewStatus::Approved);
        assert_eq!(entries[0].reviewed_by.as_deref(), Some(AUTO_REVIEWER));
    }

    #[tokio::test]
    async fn venues_given_only_by_id_do_not_merge() {
        let store = MemoryCatalog::new();
        let svc = service(&store, ValidationConfig::default());
        let at = |n: &str, uri: &str| CandidateEvent {
            name: format!("Show {n}"),
            location: Some(PlaceInput {
                id: Some(uri.into()),
                ..PlaceInput::default()
            }),
            source: None,
            ..jazz()
        };
        let a = svc
            .ingest(&ctx(), &at("A", "https://a.example/p/1"), IngestOptions::default())
            .await
            .unwrap();
        let b = svc
            .ingest(&ctx(), &at("B", "https://b.example/p/2"), IngestOptions::default())
            .await
            .unwrap();

        assert!(a.event.venue_id.is_some());
        assert_ne!(a.event.venue_id, b.event.venue_id);
        let places = store.all_places().await;
        assert_eq!(places.len(), 2);
        assert!(places
            .iter()
            .any(|p| p.federation_uri.as_deref() == Some("https://b.example/p/2")));
    }

    #[tokio::test]
    async fn replay_returns_first_event() {
        let store = MemoryCatalog::new();
        let svc = service(&store, ValidationConfig::default());
        let a = svc
            .ingest_with_idempotency(&ctx(), &jazz(), "tok", IngestOptions::default())
            .await
            .unwrap();
        let b = svc
            .ingest_with_idempotency(&ctx(), &jazz(), "tok", IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(a.event.id, b.event.id);
        assert!(!a.replayed);
        assert!(b.replayed && b.is_duplicate);
        assert_eq!(store.all_events().await.len(), 1);
    }

    #[tokio::test]
    async fn replay_of_duplicate_still_reports_duplicate() {
        let store = MemoryCatalog::new();
        let svc = service(&store, ValidationConfig::default());
        svc.ingest(&ctx(), &jazz(), IngestOptions::default()).await.unwrap();

        let dup = svc
            .ingest_with_idempotency(&ctx(), &jazz(), "k1", IngestOptions::default())
            .await
            .unwrap();
        let again = svc
            .ingest_with_idempotency(&ctx(), &jazz(), "k1", IngestOptions::default())
            .await
            .unwrap();
        assert!(dup.is_duplicate && !dup.replayed);
        assert!(again.is_duplicate && again.replayed);
        assert_eq!(again.event.id, dup.event.id);
    }

    #[tokio::test]
    async fn flagged_resubmission_refreshes_pending_review() {
        let store = MemoryCatalog::new();
        let svc = service(
            &store,
            ValidationConfig {
                require_image: true,
                ..ValidationConfig::default()
            },
        );
        let first = svc.ingest(&ctx(), &jazz(), IngestOptions::default()).await.unwrap();
        assert!(first.needs_review);

        // Same source, new description, still no image.
        let revised = CandidateEvent {
            description: Some("Live quartet, two sets".into()),
            ..jazz()
        };
        let second = svc.ingest(&ctx(), &revised, IngestOptions::default()).await.unwrap();
        assert!(second.is_duplicate && second.needs_review);
        assert_eq!(second.review_entry_id, first.review_entry_id);
        assert_eq!(second.event.lifecycle, LifecycleState::Draft);

        let entries = store.all_review_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ReviewStatus::Pending);
        assert_eq!(
            entries[0].original_payload["description"],
            serde_json::json!("Live quartet, two sets")
        );
        assert!(entries[0]
            .warnings
            .iter()
            .any(|w| w.code == WarningCode::MissingImage));
    }

    #[tokio::test]
    async fn invalid_candidate_leaves_token_unclaimed() {
        let store = MemoryCatalog::new();
        let svc = service(&store, ValidationConfig::default());
        // Validation fails before the token is claimed.
        let bad = CandidateEvent {
            name: String::new(),
            ..jazz()
        };
        assert!(svc
            .ingest_with_idempotency(&ctx(), &bad, "tok", IngestOptions::default())
            .await
            .is_err());
        let ok = svc
            .ingest_with_idempotency(&ctx(), &jazz(), "tok", IngestOptions::default())
            .await
            .unwrap();
        assert!(!ok.replayed);
    }
}
