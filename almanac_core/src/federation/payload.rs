//! Typed view of a peer's JSON-LD event document.
//!
//! Only the fields the catalog stores are lifted out; every other top-level
//! key is kept verbatim in [`FederatedEvent::extensions`].

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{Error, Result};
use crate::candidate::{OrganizationInput, PlaceInput};
use crate::catalog::models::{AttendanceMode, LifecycleState};

/// schema.org `Event` and the subtypes peers commonly send.
pub const ACCEPTED_TYPES: &[&str] = &[
    "Event",
    "BusinessEvent",
    "ChildrensEvent",
    "ComedyEvent",
    "CourseInstance",
    "DanceEvent",
    "EducationEvent",
    "ExhibitionEvent",
    "Festival",
    "FoodEvent",
    "Hackathon",
    "LiteraryEvent",
    "MusicEvent",
    "PublicationEvent",
    "SaleEvent",
    "ScreeningEvent",
    "SocialEvent",
    "SportsEvent",
    "TheaterEvent",
    "VisualArtsEvent",
];

const KNOWN_KEYS: &[&str] = &[
    "@context",
    "@id",
    "@type",
    "name",
    "description",
    "startDate",
    "endDate",
    "doorTime",
    "url",
    "image",
    "keywords",
    "inLanguage",
    "eventStatus",
    "eventAttendanceMode",
    "isAccessibleForFree",
    "license",
    "location",
    "virtualLocation",
    "organizer",
];

/// A location or organizer given inline or only by reference.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRef<T> {
    Inline(T),
    Uri(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FederatedEvent {
    /// The peer's `@id`; becomes the local federation URI.
    pub id: String,
    pub event_type: String,
    pub name: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub door_time: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub image: Option<String>,
    pub keywords: Vec<String>,
    pub in_language: Vec<String>,
    pub event_status: Option<String>,
    pub attendance_mode: Option<AttendanceMode>,
    pub is_accessible_for_free: Option<bool>,
    pub license: Option<String>,
    pub location: Option<EntityRef<PlaceInput>>,
    pub virtual_url: Option<String>,
    pub organizer: Option<EntityRef<OrganizationInput>>,
    pub extensions: Map<String, Value>,
}

impl FederatedEvent {
    /// Lifecycle implied by the peer's `eventStatus`.
    pub fn lifecycle(&self) -> LifecycleState {
        match self.event_status.as_deref().map(schema_term) {
            Some("EventCancelled") => LifecycleState::Cancelled,
            Some("EventPostponed") => LifecycleState::Postponed,
            Some("EventRescheduled") => LifecycleState::Rescheduled,
            _ => LifecycleState::Published,
        }
    }
}

/// Strip `schema:` and `http(s)://schema.org/` prefixes.
fn schema_term(s: &str) -> &str {
    let s = s.trim();
    ["https://schema.org/", "http://schema.org/", "schema:"]
        .iter()
        .find_map(|p| s.strip_prefix(p))
        .unwrap_or(s)
}

fn is_http_uri(s: &str) -> bool {
    url::Url::parse(s)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

pub fn parse(payload: &Value) -> Result<FederatedEvent> {
    let Value::Object(obj) = payload else {
        return Err(Error::InvalidPayload("expected a JSON object".to_string()));
    };
    if obj.is_empty() {
        return Err(Error::InvalidPayload("empty document".to_string()));
    }
    if !obj.contains_key("@context") {
        return Err(Error::InvalidPayload("missing @context".to_string()));
    }

    let id = match obj.get("@id") {
        Some(Value::String(id)) if is_http_uri(id.trim()) => id.trim().to_string(),
        _ => return Err(Error::MissingId),
    };
    let event_type = parse_type(obj.get("@type"))?;

    let name = text(obj.get("name"))
        .ok_or_else(|| Error::MissingRequiredField("name".to_string()))?;
    let start = match text(obj.get("startDate")) {
        Some(raw) => parse_date("startDate", &raw)?,
        None => return Err(Error::MissingRequiredField("startDate".to_string())),
    };
    let end = optional_date(obj, "endDate")?;
    let door_time = optional_date(obj, "doorTime")?;

    let (location, location_virtual) = parse_location(obj.get("location"));
    let virtual_url = match obj.get("virtualLocation") {
        Some(Value::String(u)) if is_http_uri(u.trim()) => Some(u.trim().to_string()),
        Some(Value::Object(v)) => text(v.get("url")).filter(|u| is_http_uri(u)),
        _ => None,
    }
    .or(location_virtual);

    let extensions = obj
        .iter()
        .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(FederatedEvent {
        id,
        event_type,
        name,
        description: text(obj.get("description")),
        start,
        end,
        door_time,
        url: text(obj.get("url")).filter(|u| is_http_uri(u)),
        image: parse_image(obj.get("image")),
        keywords: string_list(obj.get("keywords"), true),
        in_language: string_list(obj.get("inLanguage"), false),
        event_status: text(obj.get("eventStatus")),
        attendance_mode: text(obj.get("eventAttendanceMode")).and_then(|m| {
            match schema_term(&m) {
                "OfflineEventAttendanceMode" => Some(AttendanceMode::Offline),
                "OnlineEventAttendanceMode" => Some(AttendanceMode::Online),
                "MixedEventAttendanceMode" => Some(AttendanceMode::Mixed),
                _ => None,
            }
        }),
        is_accessible_for_free: obj.get("isAccessibleForFree").and_then(Value::as_bool),
        license: text(obj.get("license")),
        location,
        virtual_url,
        organizer: parse_organizer(obj.get("organizer")),
        extensions,
    })
}

fn parse_type(value: Option<&Value>) -> Result<String> {
    let types: Vec<&str> = match value {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => vec![],
    };
    let types: Vec<&str> = types
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    let Some(first) = types.first() else {
        return Err(Error::MissingType);
    };
    types
        .iter()
        .map(|t| schema_term(t))
        .find(|t| ACCEPTED_TYPES.contains(t))
        .map(str::to_string)
        .ok_or_else(|| Error::UnsupportedType(first.to_string()))
}

fn parse_date(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| Error::InvalidDateFormat(field.to_string()))
}

fn optional_date(obj: &Map<String, Value>, field: &str) -> Result<Option<DateTime<Utc>>> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => parse_date(field, s).map(Some),
        Some(_) => Err(Error::InvalidDateFormat(field.to_string())),
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(value: Option<&Value>, lower: bool) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => vec![],
    };
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for item in raw {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let item = if lower {
            item.to_lowercase()
        } else {
            item.to_string()
        };
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// `image` may be a URL or an `ImageObject`.
fn parse_image(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::Object(o)) => text(o.get("url")).or_else(|| text(o.get("contentUrl"))),
        other => text(other),
    }
    .filter(|u| is_http_uri(u))
}

/// Returns the physical place (if any) and a virtual URL when the location
/// is itself a `VirtualLocation`.
fn parse_location(value: Option<&Value>) -> (Option<EntityRef<PlaceInput>>, Option<String>) {
    match value {
        Some(Value::String(uri)) if is_http_uri(uri.trim()) => {
            (Some(EntityRef::Uri(uri.trim().to_string())), None)
        }
        Some(Value::Object(o)) => {
            let kind = o.get("@type").and_then(Value::as_str).map(schema_term);
            if kind == Some("VirtualLocation") {
                return (None, text(o.get("url")).filter(|u| is_http_uri(u)));
            }
            let id = text(o.get("@id")).filter(|u| is_http_uri(u));
            let Some(name) = text(o.get("name")) else {
                return (id.map(EntityRef::Uri), None);
            };
            // Address fields may sit on the place or in a nested PostalAddress.
            let address = match o.get("address") {
                Some(Value::Object(a)) => a,
                _ => o,
            };
            let geo = o.get("geo").and_then(Value::as_object);
            let coord = |key: &str| {
                geo.and_then(|g| g.get(key))
                    .or_else(|| o.get(key))
                    .and_then(Value::as_f64)
            };
            let place = PlaceInput {
                id,
                name,
                street_address: text(address.get("streetAddress")),
                address_locality: text(address.get("addressLocality")),
                address_region: text(address.get("addressRegion")),
                postal_code: text(address.get("postalCode")),
                address_country: text(address.get("addressCountry")),
                latitude: coord("latitude"),
                longitude: coord("longitude"),
            };
            (Some(EntityRef::Inline(place)), None)
        }
        _ => (None, None),
    }
}

fn parse_organizer(value: Option<&Value>) -> Option<EntityRef<OrganizationInput>> {
    let value = match value {
        // Several organizers: keep the first one.
        Some(Value::Array(items)) => items.first(),
        other => other,
    };
    match value {
        Some(Value::String(uri)) if is_http_uri(uri.trim()) => {
            Some(EntityRef::Uri(uri.trim().to_string()))
        }
        Some(Value::Object(o)) => {
            let id = text(o.get("@id")).filter(|u| is_http_uri(u));
            let Some(name) = text(o.get("name")) else {
                return id.map(EntityRef::Uri);
            };
            let address = match o.get("address") {
                Some(Value::Object(a)) => a,
                _ => o,
            };
            Some(EntityRef::Inline(OrganizationInput {
                id,
                name,
                url: text(o.get("url")).filter(|u| is_http_uri(u)),
                email: text(o.get("email")).map(|e| e.to_ascii_lowercase()),
                address_locality: text(address.get("addressLocality")),
                address_region: text(address.get("addressRegion")),
                address_country: text(address.get("addressCountry")),
            }))
        }
        _ => None,
    }
}
