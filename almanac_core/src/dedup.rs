//! Content fingerprinting, confidence scoring and classification.
//!
//! Everything here is pure; callers do the repository lookups and pass the
//! matches in.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::candidate::{correction_is_plausible, NormalizedCandidate, PlaceInput};
use crate::catalog::models::{Event, Place, Warning, WarningCode};
use crate::config::ValidationConfig;

const BASE_CONFIDENCE: f64 = 0.9;
const MISSING_FIELD_PENALTY: f64 = 0.2;
const FLAG_PENALTY: f64 = 0.1;

/// Case-fold, trim and collapse internal whitespace.
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Venue identity for fingerprinting: place id, else normalized venue name,
/// else the virtual URL. Empty when the event has no location at all.
pub fn venue_key(venue: Option<&PlaceInput>, virtual_url: Option<&str>) -> String {
    if let Some(place) = venue {
        if let Some(id) = place.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let name = normalize_text(&place.name);
        if !name.is_empty() {
            return name;
        }
    }
    virtual_url.map(|u| u.trim().to_string()).unwrap_or_default()
}

/// Lowercase hex SHA-256 over `name|venue|start`.
pub fn fingerprint(name: &str, start: DateTime<Utc>, venue_key: &str) -> String {
    let payload = format!(
        "{}|{}|{}",
        normalize_text(name),
        normalize_text(venue_key),
        start.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    sha256_hex(payload.as_bytes())
}

pub fn candidate_fingerprint(candidate: &NormalizedCandidate) -> String {
    let venue = venue_key(candidate.venue.as_ref(), candidate.virtual_url.as_deref());
    fingerprint(&candidate.name, candidate.start, &venue)
}

/// Fingerprint of a stored event, for when its name, start or venue change
/// after ingestion.
pub fn event_fingerprint(event: &Event, venue: Option<&Place>) -> Option<String> {
    let start = event.starts_at()?;
    let venue_key = match venue {
        Some(place) => place
            .federation_uri
            .clone()
            .unwrap_or_else(|| normalize_text(&place.name)),
        None => event.virtual_url.clone().unwrap_or_default(),
    };
    Some(fingerprint(&event.name, start, &venue_key))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub confidence: f64,
    pub warnings: Vec<Warning>,
}

impl Assessment {
    pub fn codes(&self) -> BTreeSet<WarningCode> {
        warning_codes(&self.warnings)
    }
}

pub fn warning_codes(warnings: &[Warning]) -> BTreeSet<WarningCode> {
    warnings.iter().map(|w| w.code).collect()
}

/// Structural checks against the validation policy.
pub fn assess(
    candidate: &NormalizedCandidate,
    policy: &ValidationConfig,
    now: DateTime<Utc>,
) -> Assessment {
    let mut warnings = Vec::new();
    let mut confidence = BASE_CONFIDENCE;

    if policy.require_description && candidate.description.is_none() {
        confidence -= MISSING_FIELD_PENALTY;
        warnings.push(Warning::new(
            "description",
            WarningCode::MissingDescription,
            "Event has no description",
        ));
    }

    if policy.require_image && candidate.image.is_none() {
        confidence -= MISSING_FIELD_PENALTY;
        warnings.push(Warning::new(
            "image",
            WarningCode::MissingImage,
            "Event has no image and the active policy requires one",
        ));
    }

    // An out-of-range horizon (policy never validated) means no limit.
    let horizon = Duration::try_days(policy.max_future_days)
        .and_then(|window| now.checked_add_signed(window));
    if horizon.is_some_and(|limit| candidate.start > limit) {
        confidence -= MISSING_FIELD_PENALTY;
        warnings.push(Warning::new(
            "startDate",
            WarningCode::TooFarFuture,
            format!(
                "Event starts more than {} days from now",
                policy.max_future_days
            ),
        ));
    }

    match (&candidate.venue, &candidate.virtual_url) {
        (None, None) => {
            confidence -= MISSING_FIELD_PENALTY;
            warnings.push(Warning::new(
                "location",
                WarningCode::MissingLocation,
                "Event has neither a venue nor a virtual location",
            ));
        }
        (Some(place), _)
            if policy.require_venue_locality && place.id.is_none() && !place.has_address() =>
        {
            confidence -= FLAG_PENALTY;
            warnings.push(Warning::new(
                "location",
                WarningCode::AmbiguousVenue,
                format!("Venue \"{}\" has no address or locality", place.name),
            ));
        }
        _ => {}
    }

    let mut flagged = false;
    if let Some(correction) = &candidate.date_correction {
        flagged = true;
        let gap = candidate.start - correction.original_end;
        if correction_is_plausible(candidate.start, correction) {
            warnings.push(Warning::new(
                "endDate",
                WarningCode::ReversedDatesTimezoneLikely,
                format!(
                    "endDate was {}m before startDate; auto-corrected as a likely timezone error",
                    gap.num_minutes()
                ),
            ));
        } else {
            warnings.push(Warning::new(
                "endDate",
                WarningCode::ReversedDatesCorrectedNeedsReview,
                format!(
                    "endDate was {}m before startDate; auto-corrected but needs review",
                    gap.num_minutes()
                ),
            ));
        }
    } else if let Some(end) = candidate.end.filter(|end| *end < candidate.start) {
        flagged = true;
        warnings.push(Warning::new(
            "endDate",
            WarningCode::ReversedDates,
            format!(
                "endDate is {}m before startDate",
                (candidate.start - end).num_minutes()
            ),
        ));
    }
    if flagged {
        confidence -= FLAG_PENALTY;
    }

    let confidence = round2(confidence.clamp(0.0, 1.0));
    if confidence < policy.review_threshold {
        warnings.push(Warning::new(
            "event",
            WarningCode::LowConfidence,
            format!(
                "Event has low data quality score ({:.0}%)",
                confidence * 100.0
            ),
        ));
    }

    Assessment {
        confidence,
        warnings,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    NewEvent,
    DuplicateOf(String),
    NeedsReview {
        warnings: Vec<Warning>,
        confidence: f64,
    },
}

/// Source identity beats fingerprint; any match beats review.
pub fn classify(
    source_match: Option<&Event>,
    fingerprint_match: Option<&Event>,
    assessment: &Assessment,
    policy: &ValidationConfig,
) -> Classification {
    if let Some(existing) = source_match.or(fingerprint_match) {
        return Classification::DuplicateOf(existing.id.clone());
    }
    if !assessment.warnings.is_empty() || assessment.confidence < policy.review_threshold {
        return Classification::NeedsReview {
            warnings: assessment.warnings.clone(),
            confidence: assessment.confidence,
        };
    }
    Classification::NewEvent
}
