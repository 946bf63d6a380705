use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Error, Result};
use crate::catalog::models::{Event, ReviewEntry, ReviewStatus, ReviewTransition};

/// Operator-supplied fixes applied by [`fix`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReviewCorrections {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub url: Option<String>,
}

impl ReviewCorrections {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn ensure_pending(entry: &ReviewEntry) -> Result<()> {
    if entry.status != ReviewStatus::Pending {
        return Err(Error::AlreadyReviewed {
            status: entry.status,
        });
    }
    Ok(())
}

fn ensure_reviewer(reviewer: &str) -> Result<()> {
    if reviewer.trim().is_empty() {
        return Err(Error::InvalidInput("reviewer is empty".to_string()));
    }
    Ok(())
}

fn clean(notes: Option<&str>) -> Option<String> {
    notes
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

#[tracing::instrument(level = "debug", skip(entry))]
pub fn approve(
    entry: &ReviewEntry,
    reviewer: &str,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ReviewTransition> {
    ensure_reviewer(reviewer)?;
    ensure_pending(entry)?;
    Ok(ReviewTransition {
        status: ReviewStatus::Approved,
        reviewed_by: reviewer.trim().to_string(),
        reviewed_at: now,
        review_notes: clean(notes),
        rejection_reason: None,
    })
}

#[tracing::instrument(level = "debug", skip(entry))]
pub fn reject(
    entry: &ReviewEntry,
    reviewer: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<ReviewTransition> {
    ensure_reviewer(reviewer)?;
    if reason.trim().is_empty() {
        return Err(Error::InvalidInput("rejection reason is required".to_string()));
    }
    ensure_pending(entry)?;
    Ok(ReviewTransition {
        status: ReviewStatus::Rejected,
        reviewed_by: reviewer.trim().to_string(),
        reviewed_at: now,
        review_notes: None,
        rejection_reason: Some(reason.trim().to_string()),
    })
}

/// An approval whose notes record which fields the operator corrected.
#[tracing::instrument(level = "debug", skip(entry, changed))]
pub fn fix(
    entry: &ReviewEntry,
    reviewer: &str,
    changed: &[String],
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ReviewTransition> {
    if changed.is_empty() {
        return Err(Error::InvalidInput("no corrections given".to_string()));
    }
    let mut transition = approve(entry, reviewer, None, now)?;
    let summary = format!("Corrections applied: {}", changed.join("; "));
    transition.review_notes = Some(match clean(notes) {
        Some(notes) => format!("{summary}\n{notes}"),
        None => summary,
    });
    Ok(transition)
}

/// Apply corrections to the event and its summary occurrence. Returns a
/// description of every field that changed.
pub fn apply_corrections(
    event: &mut Event,
    corrections: &ReviewCorrections,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let mut changed = Vec::new();

    if let Some(name) = corrections.name.as_deref().map(str::trim) {
        if name.is_empty() {
            return Err(Error::InvalidInput("name cannot be empty".to_string()));
        }
        if name != event.name {
            changed.push(format!("name: {:?} -> {:?}", event.name, name));
            event.name = name.to_string();
        }
    }
    set_optional(&mut event.description, &corrections.description, "description", &mut changed);
    set_optional(&mut event.image_url, &corrections.image, "image", &mut changed);
    set_optional(&mut event.url, &corrections.url, "url", &mut changed);

    if corrections.start_date.is_some() || corrections.end_date.is_some() {
        let Some(occ) = event.occurrences.iter_mut().min_by_key(|o| o.start) else {
            return Err(Error::InvalidInput("event has no occurrence to correct".to_string()));
        };
        if let Some(start) = corrections.start_date {
            if start != occ.start {
                changed.push(format!("startDate: {} -> {}", occ.start.to_rfc3339(), start.to_rfc3339()));
                occ.start = start;
            }
        }
        if let Some(end) = corrections.end_date {
            if Some(end) != occ.end {
                changed.push(format!("endDate: -> {}", end.to_rfc3339()));
                occ.end = Some(end);
            }
        }
        if occ.end.is_some_and(|end| end < occ.start) {
            return Err(Error::InvalidInput("endDate is before startDate".to_string()));
        }
    }

    if !changed.is_empty() {
        event.updated_at = now;
    }
    Ok(changed)
}

fn set_optional(
    slot: &mut Option<String>,
    value: &Option<String>,
    label: &str,
    changed: &mut Vec<String>,
) {
    let Some(value) = value.as_deref().map(str::trim) else {
        return;
    };
    let next = (!value.is_empty()).then(|| value.to_string());
    if *slot != next {
        changed.push(format!("{label} updated"));
        *slot = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::{
        AttendanceMode, LifecycleState, Occurrence, Warning, WarningCode, CC0_LICENSE,
    };

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn entry() -> ReviewEntry {
        let now = ts("2026-01-01T00:00:00Z");
        ReviewEntry {
            id: "01R".into(),
            event_id: "01E".into(),
            original_payload: serde_json::json!({}),
            normalized_payload: serde_json::json!({}),
            warnings: vec![Warning::new("image", WarningCode::MissingImage, "no image")],
            confidence: 0.7,
            source: None,
            fingerprint: Some("fp".into()),
            event_start: ts("2026-07-10T19:00:00Z"),
            event_end: None,
            status: ReviewStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn event() -> Event {
        let now = ts("2026-01-01T00:00:00Z");
        Event {
            id: "01E".into(),
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
            lifecycle: LifecycleState::Draft,
            confidence: Some(0.7),
            organizer_id: None,
            venue_id: None,
            virtual_url: None,
            source: None,
            fingerprint: Some("fp".into()),
            federation_uri: None,
            origin_node: None,
            extensions: Default::default(),
            deleted_at: None,
            deletion_reason: None,
            merged_into: None,
            created_at: now,
            updated_at: now,
            occurrences: vec![Occurrence {
                id: "01O".into(),
                event_id: "01E".into(),
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

    #[test]
    fn approve_requires_pending() {
        let now = Utc::now();
        let t = approve(&entry(), "alice", Some(" looks fine "), now).unwrap();
        assert_eq!(t.status, ReviewStatus::Approved);
        assert_eq!(t.review_notes.as_deref(), Some("looks fine"));

        let mut decided = entry();
        decided.apply(&t);
        let err = approve(&decided, "bob", None, now).unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyReviewed {
                status: ReviewStatus::Approved
            }
        ));
    }

    #[test]
    fn reject_requires_reason() {
        let err = reject(&entry(), "alice", "  ", Utc::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let t = reject(&entry(), "alice", "spam", Utc::now()).unwrap();
        assert_eq!(t.rejection_reason.as_deref(), Some("spam"));
    }

    #[test]
    fn corrections_touch_summary_occurrence() {
        let mut e = event();
        let changed = apply_corrections(
            &mut e,
            &ReviewCorrections {
                image: Some("https://img.example/j.png".into()),
                end_date: Some(ts("2026-07-10T22:00:00Z")),
                ..ReviewCorrections::default()
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(changed.len(), 2);
        assert_eq!(e.image_url.as_deref(), Some("https://img.example/j.png"));
        assert_eq!(e.occurrences[0].end, Some(ts("2026-07-10T22:00:00Z")));

        let t = fix(&entry(), "alice", &changed, Some("added poster"), Utc::now()).unwrap();
        let notes = t.review_notes.unwrap();
        assert!(notes.starts_with("Corrections applied: image updated"));
        assert!(notes.ends_with("added poster"));
    }

    #[test]
    fn reversed_correction_is_invalid() {
        let mut e = event();
        let err = apply_corrections(
            &mut e,
            &ReviewCorrections {
                end_date: Some(ts("2026-07-09T22:00:00Z")),
                ..ReviewCorrections::default()
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
