//! Place and organization identity resolution.
//!
//! Direct ingestion and federation sync both resolve venues and organizers
//! through these functions, so the two entry points can never disagree on
//! what counts as "the same place".

use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::models::{Organization, Place};
use super::traits::CatalogTx;
use super::Result;
use crate::candidate::{OrganizationInput, PlaceInput};
use crate::dedup::normalize_text;

/// Normalized `name|street|locality`. A nameless place known only by its
/// `@id` is keyed by that URI instead, so unrelated venues never share the
/// empty key.
pub fn place_natural_key(place: &PlaceInput) -> String {
    if normalize_text(&place.name).is_empty() {
        if let Some(uri) = federation_uri(place.id.as_deref()) {
            return format!("@id|{uri}");
        }
    }
    format!(
        "{}|{}|{}",
        normalize_text(&place.name),
        normalize_text(place.street_address.as_deref().unwrap_or_default()),
        normalize_text(place.address_locality.as_deref().unwrap_or_default()),
    )
}

/// Normalized `name|host`, the host taken from the organization URL.
/// Nameless organizations are keyed by `@id` like places.
pub fn organization_natural_key(org: &OrganizationInput) -> String {
    if normalize_text(&org.name).is_empty() {
        if let Some(uri) = federation_uri(org.id.as_deref()) {
            return format!("@id|{uri}");
        }
    }
    let host = org
        .url
        .as_deref()
        .and_then(|u| url::Url::parse(u.trim()).ok())
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_ascii_lowercase()))
        .unwrap_or_default();
    format!("{}|{}", normalize_text(&org.name), host)
}

/// Only absolute http(s) identifiers are treated as federation URIs.
fn federation_uri(id: Option<&str>) -> Option<String> {
    let id = id?.trim();
    let parsed = url::Url::parse(id).ok()?;
    matches!(parsed.scheme(), "http" | "https").then(|| id.to_string())
}

/// Find or create the place for `input`. A known `@id` wins; otherwise the
/// place is upserted by natural key and gaps in an existing row are filled.
#[tracing::instrument(level = "debug", skip_all, fields(place = %input.name))]
pub async fn resolve_place(
    tx: &mut dyn CatalogTx,
    input: &PlaceInput,
    now: DateTime<Utc>,
) -> Result<Place> {
    let uri = federation_uri(input.id.as_deref());
    if let Some(uri) = &uri {
        if let Some(existing) = tx.find_place_by_federation_uri(uri).await? {
            return Ok(existing);
        }
    }
    let candidate = Place {
        id: Ulid::new().to_string(),
        name: input.name.clone(),
        street_address: input.street_address.clone(),
        locality: input.address_locality.clone(),
        region: input.address_region.clone(),
        postal_code: input.postal_code.clone(),
        country: input.address_country.clone(),
        latitude: input.latitude,
        longitude: input.longitude,
        federation_uri: uri,
        natural_key: place_natural_key(input),
        deleted_at: None,
        created_at: now,
        updated_at: now,
    };
    tx.upsert_place(&candidate).await
}

#[tracing::instrument(level = "debug", skip_all, fields(organization = %input.name))]
pub async fn resolve_organization(
    tx: &mut dyn CatalogTx,
    input: &OrganizationInput,
    now: DateTime<Utc>,
) -> Result<Organization> {
    let uri = federation_uri(input.id.as_deref());
    if let Some(uri) = &uri {
        if let Some(existing) = tx.find_organization_by_federation_uri(uri).await? {
            return Ok(existing);
        }
    }
    let candidate = Organization {
        id: Ulid::new().to_string(),
        name: input.name.clone(),
        url: input.url.clone(),
        email: input.email.clone(),
        locality: input.address_locality.clone(),
        region: input.address_region.clone(),
        country: input.address_country.clone(),
        federation_uri: uri,
        natural_key: organization_natural_key(input),
        deleted_at: None,
        created_at: now,
        updated_at: now,
    };
    tx.upsert_organization(&candidate).await
}
