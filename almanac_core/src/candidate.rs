//! Submitted event input: wire shape, normalization and structural checks.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::models::{SourceIdentity, CC0_LICENSE};

const MAX_NAME_CHARS: usize = 500;
const MAX_DESCRIPTION_CHARS: usize = 10_000;

/// A structural problem with a submission. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CandidateEvent {
    pub name: String,
    pub description: Option<String>,
    /// RFC 3339 timestamp or `YYYY-MM-DD`.
    pub start_date: String,
    pub end_date: Option<String>,
    pub door_time: Option<String>,
    pub timezone: Option<String>,
    pub location: Option<PlaceInput>,
    pub virtual_location: Option<VirtualLocationInput>,
    pub organizer: Option<OrganizationInput>,
    pub image: Option<String>,
    pub url: Option<String>,
    pub keywords: Vec<String>,
    pub in_language: Vec<String>,
    pub is_accessible_for_free: Option<bool>,
    pub offers: Option<OfferInput>,
    pub license: Option<String>,
    pub source: Option<SourceInput>,
    pub occurrences: Vec<OccurrenceInput>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlaceInput {
    #[serde(rename = "@id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub street_address: Option<String>,
    pub address_locality: Option<String>,
    pub address_region: Option<String>,
    pub postal_code: Option<String>,
    pub address_country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl PlaceInput {
    pub fn has_address(&self) -> bool {
        present(&self.street_address) || present(&self.address_locality)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualLocationInput {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrganizationInput {
    #[serde(rename = "@id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub url: Option<String>,
    pub email: Option<String>,
    pub address_locality: Option<String>,
    pub address_region: Option<String>,
    pub address_country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OfferInput {
    pub url: Option<String>,
    /// Free text: "25", "$25.00", "Free".
    pub price: Option<String>,
    pub price_currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceInput {
    pub name: Option<String>,
    pub url: Option<String>,
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OccurrenceInput {
    pub start_date: String,
    pub end_date: Option<String>,
    pub door_time: Option<String>,
    pub timezone: Option<String>,
    pub virtual_url: Option<String>,
}

/// One concrete time slot after parsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub door_time: Option<DateTime<Utc>>,
    pub timezone: String,
    pub virtual_url: Option<String>,
}

/// Records that normalization moved a reversed end date forward a day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DateCorrection {
    pub original_end: DateTime<Utc>,
    pub corrected_end: DateTime<Utc>,
}

/// A candidate that passed structural validation, with every field trimmed
/// and parsed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedCandidate {
    pub name: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    /// May still precede `start`; that is a review warning, not an error.
    pub end: Option<DateTime<Utc>>,
    pub door_time: Option<DateTime<Utc>>,
    pub timezone: String,
    pub date_correction: Option<DateCorrection>,
    pub venue: Option<PlaceInput>,
    pub virtual_url: Option<String>,
    pub organizer: Option<OrganizationInput>,
    pub image: Option<String>,
    pub url: Option<String>,
    pub keywords: Vec<String>,
    pub in_language: Vec<String>,
    pub is_accessible_for_free: Option<bool>,
    pub ticket_url: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub license_url: String,
    pub source: Option<SourceIdentity>,
    /// Explicit extra occurrences, earliest first. Empty when the candidate
    /// only gave top-level dates.
    pub extra_slots: Vec<Slot>,
}

impl NormalizedCandidate {
    pub fn has_reversed_dates(&self) -> bool {
        self.end.is_some_and(|end| end < self.start)
    }

    /// All slots to store. The top-level dates always form the first one; a
    /// reversed end is dropped so the stored occurrence stays well-formed.
    pub fn slots(&self) -> Vec<Slot> {
        let primary = Slot {
            start: self.start,
            end: self.end.filter(|end| *end >= self.start),
            door_time: self.door_time,
            timezone: self.timezone.clone(),
            virtual_url: self.virtual_url.clone(),
        };
        let mut out = vec![primary];
        out.extend(
            self.extra_slots
                .iter()
                .filter(|s| s.start != self.start)
                .cloned(),
        );
        out
    }
}

/// Normalize then validate. The returned candidate is safe to persist.
#[tracing::instrument(level = "debug", skip_all)]
pub fn prepare(
    candidate: &CandidateEvent,
    default_timezone: &str,
) -> Result<NormalizedCandidate, ValidationError> {
    let name = collapse_whitespace(&candidate.name);
    if name.is_empty() {
        return Err(ValidationError::new("name", "required"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(ValidationError::new("name", "too long"));
    }

    let description = trimmed(&candidate.description);
    if description
        .as_deref()
        .is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_CHARS)
    {
        return Err(ValidationError::new("description", "too long"));
    }

    let timezone = trimmed(&candidate.timezone).unwrap_or_else(|| default_timezone.to_string());

    let mut extra_slots = candidate
        .occurrences
        .iter()
        .enumerate()
        .map(|(i, occ)| parse_occurrence(i, occ, &timezone))
        .collect::<Result<Vec<_>, _>>()?;
    extra_slots.sort_by_key(|s| s.start);

    let raw_start = candidate.start_date.trim();
    let start = if !raw_start.is_empty() {
        parse_timestamp("startDate", raw_start)?
    } else {
        match extra_slots.first() {
            Some(slot) => slot.start,
            None => return Err(ValidationError::new("startDate", "required")),
        }
    };
    let raw_end = match trimmed(&candidate.end_date) {
        Some(raw) => Some(parse_timestamp("endDate", &raw)?),
        None => None,
    };
    let door_time = match trimmed(&candidate.door_time) {
        Some(raw) => Some(parse_timestamp("doorTime", &raw)?),
        None => None,
    };

    let (end, date_correction) = match raw_end {
        Some(end) => match correct_overnight_end(start, end) {
            Some(corrected) => (
                Some(corrected),
                Some(DateCorrection {
                    original_end: end,
                    corrected_end: corrected,
                }),
            ),
            None => (Some(end), None),
        },
        None => (None, None),
    };

    let venue = candidate.location.as_ref().map(normalize_place);
    if let Some(place) = &venue {
        if place.name.is_empty() && place.id.is_none() {
            return Err(ValidationError::new("location.name", "required"));
        }
        if let Some(id) = &place.id {
            check_url("location.@id", id)?;
        }
    }

    let virtual_url = match &candidate.virtual_location {
        Some(v) => {
            let url = v.url.trim();
            if url.is_empty() {
                return Err(ValidationError::new("virtualLocation.url", "required"));
            }
            check_url("virtualLocation.url", url)?;
            Some(url.to_string())
        }
        None => None,
    };

    let organizer = match &candidate.organizer {
        Some(org) => {
            let org = normalize_organization(org);
            if org.name.is_empty() {
                return Err(ValidationError::new("organizer.name", "required"));
            }
            if let Some(url) = &org.url {
                check_url("organizer.url", url)?;
            }
            Some(org)
        }
        None => None,
    };

    let image = trimmed(&candidate.image);
    if let Some(image) = &image {
        check_url("image", image)?;
    }
    let url = trimmed(&candidate.url);
    if let Some(url) = &url {
        check_url("url", url)?;
    }

    let license_url = match trimmed(&candidate.license) {
        Some(license) if is_cc0(&license) => CC0_LICENSE.to_string(),
        Some(_) => return Err(ValidationError::new("license", "must be CC0")),
        None => CC0_LICENSE.to_string(),
    };

    let (ticket_url, price, currency) = match &candidate.offers {
        Some(offer) => {
            let ticket_url = trimmed(&offer.url);
            if let Some(url) = &ticket_url {
                check_url("offers.url", url)?;
            }
            let price = match trimmed(&offer.price) {
                Some(raw) => Some(parse_price(&raw)?),
                None => None,
            };
            (
                ticket_url,
                price,
                trimmed(&offer.price_currency).map(|c| c.to_ascii_uppercase()),
            )
        }
        None => (None, None, None),
    };

    let source = match &candidate.source {
        Some(src) => source_identity(src)?,
        None => None,
    };

    Ok(NormalizedCandidate {
        name,
        description,
        start,
        end,
        door_time,
        timezone,
        date_correction,
        venue,
        virtual_url,
        organizer,
        image,
        url,
        keywords: normalize_list(&candidate.keywords, true),
        in_language: normalize_list(&candidate.in_language, true),
        is_accessible_for_free: candidate.is_accessible_for_free,
        ticket_url,
        price,
        currency,
        license_url,
        source,
        extra_slots,
    })
}

/// Accepts RFC 3339, or a bare date which becomes midnight UTC.
pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(ValidationError::new(field, "invalid date format"))
}

/// An end that falls less than a day before the start is almost always an
/// overnight event whose end lost its date during timezone conversion.
pub fn correct_overnight_end(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if end >= start {
        return None;
    }
    let corrected = end + Duration::hours(24);
    if corrected > start && corrected - start < Duration::hours(24) {
        Some(corrected)
    } else {
        None
    }
}

/// Whether a correction matches the timezone-slip pattern closely enough
/// to trust: original end in the small hours and a short corrected event.
pub fn correction_is_plausible(start: DateTime<Utc>, correction: &DateCorrection) -> bool {
    let duration = correction.corrected_end - start;
    correction.original_end.hour() <= 4
        && duration > Duration::zero()
        && duration < Duration::hours(7)
}

pub fn check_url(field: &str, raw: &str) -> Result<(), ValidationError> {
    match url::Url::parse(raw.trim()) {
        Ok(u) if matches!(u.scheme(), "http" | "https") && u.host_str().is_some() => Ok(()),
        _ => Err(ValidationError::new(field, "invalid URI")),
    }
}

fn parse_occurrence(
    index: usize,
    occ: &OccurrenceInput,
    default_timezone: &str,
) -> Result<Slot, ValidationError> {
    let prefix = format!("occurrences[{index}]");
    let start = parse_timestamp(&format!("{prefix}.startDate"), &occ.start_date)?;
    let end = match trimmed(&occ.end_date) {
        Some(raw) => Some(parse_timestamp(&format!("{prefix}.endDate"), &raw)?),
        None => None,
    };
    if end.is_some_and(|end| end < start) {
        return Err(ValidationError::new(
            format!("{prefix}.endDate"),
            "must be on or after startDate",
        ));
    }
    let door_time = match trimmed(&occ.door_time) {
        Some(raw) => Some(parse_timestamp(&format!("{prefix}.doorTime"), &raw)?),
        None => None,
    };
    let virtual_url = trimmed(&occ.virtual_url);
    if let Some(url) = &virtual_url {
        check_url(&format!("{prefix}.virtualUrl"), url)?;
    }
    Ok(Slot {
        start,
        end,
        door_time,
        timezone: trimmed(&occ.timezone).unwrap_or_else(|| default_timezone.to_string()),
        virtual_url,
    })
}

fn source_identity(src: &SourceInput) -> Result<Option<SourceIdentity>, ValidationError> {
    let url = trimmed(&src.url);
    if let Some(url) = &url {
        check_url("source.url", url)?;
    }
    let key = url
        .map(|u| u.trim_end_matches('/').to_ascii_lowercase())
        .or_else(|| trimmed(&src.name).map(|n| n.to_ascii_lowercase()));
    let external_id = trimmed(&src.event_id);
    match (key, external_id) {
        (Some(key), Some(external_id)) => Ok(Some(SourceIdentity { key, external_id })),
        (Some(_), None) => Err(ValidationError::new("source.eventId", "required")),
        (None, Some(_)) => Err(ValidationError::new("source.name", "required")),
        (None, None) => Ok(None),
    }
}

/// Accepts "Free", "0", "25.00", "$25".
fn parse_price(raw: &str) -> Result<f64, ValidationError> {
    if raw.eq_ignore_ascii_case("free") {
        return Ok(0.0);
    }
    let digits: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits
        .parse::<f64>()
        .ok()
        .filter(|p| *p >= 0.0)
        .ok_or_else(|| ValidationError::new("offers.price", "invalid price"))
}

fn is_cc0(license: &str) -> bool {
    let l = license.trim().to_ascii_lowercase();
    l == "cc0" || l.contains("publicdomain/zero/1.0")
}

fn normalize_place(place: &PlaceInput) -> PlaceInput {
    PlaceInput {
        id: trimmed(&place.id),
        name: collapse_whitespace(&place.name),
        street_address: trimmed(&place.street_address),
        address_locality: trimmed(&place.address_locality),
        address_region: trimmed(&place.address_region),
        postal_code: trimmed(&place.postal_code),
        address_country: trimmed(&place.address_country),
        latitude: place.latitude,
        longitude: place.longitude,
    }
}

fn normalize_organization(org: &OrganizationInput) -> OrganizationInput {
    OrganizationInput {
        id: trimmed(&org.id),
        name: collapse_whitespace(&org.name),
        url: trimmed(&org.url),
        email: trimmed(&org.email).map(|e| e.to_ascii_lowercase()),
        address_locality: trimmed(&org.address_locality),
        address_region: trimmed(&org.address_region),
        address_country: trimmed(&org.address_country),
    }
}

fn normalize_list(values: &[String], lower: bool) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for v in values {
        let v = v.trim();
        if v.is_empty() {
            continue;
        }
        let v = if lower { v.to_lowercase() } else { v.to_string() };
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> CandidateEvent {
        CandidateEvent {
            name: "  Jazz   Night ".into(),
            start_date: "2026-07-10T19:00:00Z".into(),
            ..CandidateEvent::default()
        }
    }

    #[test]
    fn date_only_start_becomes_midnight_utc() {
        let c = CandidateEvent {
            start_date: "2026-07-10".into(),
            ..base()
        };
        let n = prepare(&c, "UTC").unwrap();
        assert_eq!(n.start.to_rfc3339(), "2026-07-10T00:00:00+00:00");
        assert_eq!(n.name, "Jazz Night");
    }

    #[test]
    fn missing_name_names_the_field() {
        let c = CandidateEvent {
            name: "   ".into(),
            ..base()
        };
        let err = prepare(&c, "UTC").unwrap_err();
        assert_eq!(err.field, "name");
    }

    #[test]
    fn bad_start_is_rejected() {
        let c = CandidateEvent {
            start_date: "next tuesday".into(),
            ..base()
        };
        assert_eq!(prepare(&c, "UTC").unwrap_err().field, "startDate");
    }

    #[test]
    fn overnight_end_is_corrected() {
        let c = CandidateEvent {
            start_date: "2026-07-10T22:00:00Z".into(),
            end_date: Some("2026-07-10T02:00:00Z".into()),
            ..base()
        };
        let n = prepare(&c, "UTC").unwrap();
        let correction = n.date_correction.unwrap();
        assert_eq!(n.end.unwrap().to_rfc3339(), "2026-07-11T02:00:00+00:00");
        assert!(correction_is_plausible(n.start, &correction));
        assert!(!n.has_reversed_dates());
    }

    #[test]
    fn far_reversed_end_is_kept_but_not_stored() {
        let c = CandidateEvent {
            start_date: "2026-07-10T19:00:00Z".into(),
            end_date: Some("2026-07-08T21:00:00Z".into()),
            ..base()
        };
        let n = prepare(&c, "UTC").unwrap();
        assert!(n.date_correction.is_none());
        assert!(n.has_reversed_dates());
        assert_eq!(n.slots()[0].end, None);
    }

    #[test]
    fn source_needs_event_id() {
        let c = CandidateEvent {
            source: Some(SourceInput {
                name: Some("scraperA".into()),
                ..SourceInput::default()
            }),
            ..base()
        };
        assert_eq!(prepare(&c, "UTC").unwrap_err().field, "source.eventId");
    }

    #[test]
    fn source_key_prefers_url() {
        let c = CandidateEvent {
            source: Some(SourceInput {
                name: Some("Scraper A".into()),
                url: Some("https://Scraper.example/feed/".into()),
                event_id: Some("evt-1".into()),
            }),
            ..base()
        };
        let n = prepare(&c, "UTC").unwrap();
        let source = n.source.unwrap();
        assert_eq!(source.key, "https://scraper.example/feed");
        assert_eq!(source.external_id, "evt-1");
    }

    #[test]
    fn non_cc0_license_is_rejected() {
        let c = CandidateEvent {
            license: Some("https://creativecommons.org/licenses/by/4.0/".into()),
            ..base()
        };
        assert_eq!(prepare(&c, "UTC").unwrap_err().field, "license");
    }

    #[test]
    fn prices_parse_leniently() {
        assert_eq!(parse_price("Free").unwrap(), 0.0);
        assert_eq!(parse_price("$25.00").unwrap(), 25.0);
        assert!(parse_price("call us").is_err());
    }

    #[test]
    fn urls_must_be_http() {
        assert!(check_url("image", "https://img.example/a.png").is_ok());
        assert!(check_url("image", "ftp://img.example/a.png").is_err());
        assert!(check_url("image", "not a url").is_err());
    }

    #[test]
    fn reversed_occurrence_is_an_error() {
        let c = CandidateEvent {
            occurrences: vec![OccurrenceInput {
                start_date: "2026-07-10T19:00:00Z".into(),
                end_date: Some("2026-07-09T19:00:00Z".into()),
                ..OccurrenceInput::default()
            }],
            ..base()
        };
        assert_eq!(
            prepare(&c, "UTC").unwrap_err().field,
            "occurrences[0].endDate"
        );
    }
}
