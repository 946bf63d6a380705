use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};

use super::models::{
    AttendanceMode, BatchItemResult, BatchState, BatchStatus, EntityKind, Event, FederationNode,
    IdempotencyKey, LifecycleState, Occurrence, Organization, Place, ReviewEntry, ReviewStatus,
    ReviewTransition, SourceIdentity, Tombstone, Warning,
};
use super::traits::{CatalogStore, CatalogTx};
use super::{Error, Result};
use crate::config::PostgresConfig;

const EVENT_COLUMNS: &str = "id, name, description, url, image_url, keywords, in_language, \
    is_accessible_for_free, attendance_mode, event_status, license_url, lifecycle, confidence, \
    organizer_id, venue_id, virtual_url, source_key, source_external_id, fingerprint, \
    federation_uri, origin_node, extensions, deleted_at, deletion_reason, merged_into, \
    created_at, updated_at";

const OCCURRENCE_COLUMNS: &str = "id, event_id, start_time, end_time, door_time, timezone, \
    venue_id, virtual_url, ticket_url, price_min, price_max, currency";

const PLACE_COLUMNS: &str = "id, name, street_address, locality, region, postal_code, country, \
    latitude, longitude, federation_uri, natural_key, deleted_at, created_at, updated_at";

const ORGANIZATION_COLUMNS: &str = "id, name, url, email, locality, region, country, \
    federation_uri, natural_key, deleted_at, created_at, updated_at";

const REVIEW_COLUMNS: &str = "id, event_id, original_payload, normalized_payload, warnings, \
    confidence, source_key, source_external_id, fingerprint, event_start, event_end, status, \
    reviewed_by, reviewed_at, review_notes, rejection_reason, created_at, updated_at";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS places (
        id             TEXT PRIMARY KEY,
        name           TEXT NOT NULL,
        street_address TEXT NULL,
        locality       TEXT NULL,
        region         TEXT NULL,
        postal_code    TEXT NULL,
        country        TEXT NULL,
        latitude       DOUBLE PRECISION NULL,
        longitude      DOUBLE PRECISION NULL,
        federation_uri TEXT NULL,
        natural_key    TEXT NOT NULL,
        deleted_at     TIMESTAMPTZ NULL,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS places_natural_key_idx
      ON places (natural_key) WHERE deleted_at IS NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS places_federation_uri_idx
      ON places (federation_uri) WHERE federation_uri IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS organizations (
        id             TEXT PRIMARY KEY,
        name           TEXT NOT NULL,
        url            TEXT NULL,
        email          TEXT NULL,
        locality       TEXT NULL,
        region         TEXT NULL,
        country        TEXT NULL,
        federation_uri TEXT NULL,
        natural_key    TEXT NOT NULL,
        deleted_at     TIMESTAMPTZ NULL,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS organizations_natural_key_idx
      ON organizations (natural_key) WHERE deleted_at IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id                     TEXT PRIMARY KEY,
        name                   TEXT NOT NULL,
        description            TEXT NULL,
        url                    TEXT NULL,
        image_url              TEXT NULL,
        keywords               JSONB NOT NULL,
        in_language            JSONB NOT NULL,
        is_accessible_for_free BOOLEAN NULL,
        attendance_mode        TEXT NOT NULL,
        event_status           TEXT NULL,
        license_url            TEXT NOT NULL,
        lifecycle              TEXT NOT NULL,
        confidence             DOUBLE PRECISION NULL,
        organizer_id           TEXT NULL REFERENCES organizations (id),
        venue_id               TEXT NULL REFERENCES places (id),
        virtual_url            TEXT NULL,
        source_key             TEXT NULL,
        source_external_id     TEXT NULL,
        fingerprint            TEXT NULL,
        federation_uri         TEXT NULL,
        origin_node            TEXT NULL,
        extensions             JSONB NOT NULL,
        deleted_at             TIMESTAMPTZ NULL,
        deletion_reason        TEXT NULL,
        merged_into            TEXT NULL,
        created_at             TIMESTAMPTZ NOT NULL,
        updated_at             TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS events_source_identity_idx
      ON events (source_key, source_external_id)
      WHERE deleted_at IS NULL AND source_key IS NOT NULL
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS events_fingerprint_idx
      ON events (fingerprint) WHERE deleted_at IS NULL AND fingerprint IS NOT NULL
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS events_federation_uri_idx
      ON events (federation_uri) WHERE deleted_at IS NULL AND federation_uri IS NOT NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS occurrences (
        id          TEXT PRIMARY KEY,
        event_id    TEXT NOT NULL REFERENCES events (id) ON DELETE CASCADE,
        start_time  TIMESTAMPTZ NOT NULL,
        end_time    TIMESTAMPTZ NULL,
        door_time   TIMESTAMPTZ NULL,
        timezone    TEXT NOT NULL,
        venue_id    TEXT NULL,
        virtual_url TEXT NULL,
        ticket_url  TEXT NULL,
        price_min   DOUBLE PRECISION NULL,
        price_max   DOUBLE PRECISION NULL,
        currency    TEXT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS occurrences_event_start_idx
      ON occurrences (event_id, start_time)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tombstones (
        kind          TEXT NOT NULL,
        entity_id     TEXT NOT NULL,
        uri           TEXT NOT NULL,
        deleted_at    TIMESTAMPTZ NOT NULL,
        reason        TEXT NOT NULL,
        superseded_by TEXT NULL,
        snapshot      JSONB NOT NULL,
        PRIMARY KEY (kind, entity_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS idempotency_keys (
        key          TEXT PRIMARY KEY,
        request_hash TEXT NOT NULL,
        event_id     TEXT NULL,
        created_at   TIMESTAMPTZ NOT NULL,
        expires_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idempotency_keys_expires_idx
      ON idempotency_keys (expires_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS review_queue (
        id                 TEXT PRIMARY KEY,
        event_id           TEXT NOT NULL REFERENCES events (id),
        original_payload   JSONB NOT NULL,
        normalized_payload JSONB NOT NULL,
        warnings           JSONB NOT NULL,
        confidence         DOUBLE PRECISION NOT NULL,
        source_key         TEXT NULL,
        source_external_id TEXT NULL,
        fingerprint        TEXT NULL,
        event_start        TIMESTAMPTZ NOT NULL,
        event_end          TIMESTAMPTZ NULL,
        status             TEXT NOT NULL,
        reviewed_by        TEXT NULL,
        reviewed_at        TIMESTAMPTZ NULL,
        review_notes       TEXT NULL,
        rejection_reason   TEXT NULL,
        created_at         TIMESTAMPTZ NOT NULL,
        updated_at         TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS review_queue_status_id_idx
      ON review_queue (status, id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS review_queue_rejected_fingerprint_idx
      ON review_queue (fingerprint) WHERE status = 'rejected'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS review_queue_rejected_source_idx
      ON review_queue (source_key, source_external_id) WHERE status = 'rejected'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS federation_nodes (
        domain       TEXT PRIMARY KEY,
        name         TEXT NOT NULL,
        base_url     TEXT NOT NULL,
        trust_level  INTEGER NOT NULL,
        sync_enabled BOOLEAN NOT NULL,
        is_online    BOOLEAN NOT NULL,
        last_sync_at TIMESTAMPTZ NULL,
        created_at   TIMESTAMPTZ NOT NULL,
        updated_at   TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingest_batches (
        id           TEXT PRIMARY KEY,
        state        TEXT NOT NULL,
        total        BIGINT NOT NULL,
        created      BIGINT NOT NULL,
        duplicates   BIGINT NOT NULL,
        needs_review BIGINT NOT NULL,
        failed       BIGINT NOT NULL,
        results      JSONB NOT NULL,
        submitted_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ NULL
    )
    "#,
    "ALTER TABLE ingest_batches ADD COLUMN IF NOT EXISTS error TEXT NULL",
];

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.acquire_timeout)
            .connect(&cfg.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotent schema setup.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalog {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn begin(&self) -> Result<Box<dyn CatalogTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

/// Unique violations become `Conflict` naming the constraint.
fn map_write_err(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return Error::conflict(db.constraint().unwrap_or("unique").to_string());
        }
    }
    Error::Sqlx(err)
}

impl PgTx {
    async fn occurrences_for(&mut self, event_id: &str) -> Result<Vec<Occurrence>> {
        let rows = sqlx::query(&format!(
            "SELECT {OCCURRENCE_COLUMNS} FROM occurrences WHERE event_id = $1 ORDER BY start_time ASC"
        ))
        .bind(event_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(occurrence_from_row).collect()
    }

    async fn hydrate(&mut self, row: Option<PgRow>) -> Result<Option<Event>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let mut event = event_from_row(&row)?;
        event.occurrences = self.occurrences_for(&event.id).await?;
        Ok(Some(event))
    }

    async fn find_live_event(&mut self, predicate: &str, value: &str) -> Result<Option<Event>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE deleted_at IS NULL AND {predicate} = $1 LIMIT 1"
        ))
        .bind(value)
        .fetch_optional(&mut *self.tx)
        .await?;
        self.hydrate(row).await
    }

    async fn replace_occurrences(&mut self, event: &Event) -> Result<()> {
        sqlx::query("DELETE FROM occurrences WHERE event_id = $1")
            .bind(&event.id)
            .execute(&mut *self.tx)
            .await?;
        for occ in &event.occurrences {
            sqlx::query(&format!(
                "INSERT INTO occurrences ({OCCURRENCE_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
            ))
            .bind(&occ.id)
            .bind(&event.id)
            .bind(occ.start)
            .bind(occ.end)
            .bind(occ.door_time)
            .bind(&occ.timezone)
            .bind(&occ.venue_id)
            .bind(&occ.virtual_url)
            .bind(&occ.ticket_url)
            .bind(occ.price_min)
            .bind(occ.price_max)
            .bind(&occ.currency)
            .execute(&mut *self.tx)
            .await
            .map_err(map_write_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogTx for PgTx {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_event(&mut self, id: &str) -> Result<Option<Event>> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        self.hydrate(row).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn find_event_by_source(&mut self, source: &SourceIdentity) -> Result<Option<Event>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE deleted_at IS NULL AND source_key = $1 AND source_external_id = $2 LIMIT 1"
        ))
        .bind(&source.key)
        .bind(&source.external_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        self.hydrate(row).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn find_event_by_fingerprint(&mut self, fingerprint: &str) -> Result<Option<Event>> {
        self.find_live_event("fingerprint", fingerprint).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn find_event_by_federation_uri(&mut self, uri: &str) -> Result<Option<Event>> {
        self.find_live_event("federation_uri", uri).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn insert_event(&mut self, event: &Event) -> Result<()> {
        let (source_key, external_id) = split_source(&event.source);
        sqlx::query(&format!(
            "INSERT INTO events ({EVENT_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
              $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)"
        ))
        .bind(&event.id)
        .bind(&event.name)
        .bind(&event.description)
        .bind(&event.url)
        .bind(&event.image_url)
        .bind(Json(&event.keywords))
        .bind(Json(&event.in_language))
        .bind(event.is_accessible_for_free)
        .bind(event.attendance_mode.as_str())
        .bind(&event.event_status)
        .bind(&event.license_url)
        .bind(event.lifecycle.as_str())
        .bind(event.confidence)
        .bind(&event.organizer_id)
        .bind(&event.venue_id)
        .bind(&event.virtual_url)
        .bind(source_key)
        .bind(external_id)
        .bind(&event.fingerprint)
        .bind(&event.federation_uri)
        .bind(&event.origin_node)
        .bind(Json(&event.extensions))
        .bind(event.deleted_at)
        .bind(&event.deletion_reason)
        .bind(&event.merged_into)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_err)?;

        self.replace_occurrences(event).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn update_event(&mut self, event: &Event) -> Result<()> {
        let (source_key, external_id) = split_source(&event.source);
        let res = sqlx::query(
            r#"
            UPDATE events SET
                name = $2, description = $3, url = $4, image_url = $5, keywords = $6,
                in_language = $7, is_accessible_for_free = $8, attendance_mode = $9,
                event_status = $10, license_url = $11, lifecycle = $12, confidence = $13,
                organizer_id = $14, venue_id = $15, virtual_url = $16, source_key = $17,
                source_external_id = $18, fingerprint = $19, federation_uri = $20,
                origin_node = $21, extensions = $22, deleted_at = $23, deletion_reason = $24,
                merged_into = $25, updated_at = $26
             WHERE id = $1
            "#,
        )
        .bind(&event.id)
        .bind(&event.name)
        .bind(&event.description)
        .bind(&event.url)
        .bind(&event.image_url)
        .bind(Json(&event.keywords))
        .bind(Json(&event.in_language))
        .bind(event.is_accessible_for_free)
        .bind(event.attendance_mode.as_str())
        .bind(&event.event_status)
        .bind(&event.license_url)
        .bind(event.lifecycle.as_str())
        .bind(event.confidence)
        .bind(&event.organizer_id)
        .bind(&event.venue_id)
        .bind(&event.virtual_url)
        .bind(source_key)
        .bind(external_id)
        .bind(&event.fingerprint)
        .bind(&event.federation_uri)
        .bind(&event.origin_node)
        .bind(Json(&event.extensions))
        .bind(event.deleted_at)
        .bind(&event.deletion_reason)
        .bind(&event.merged_into)
        .bind(event.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("event {}", event.id)));
        }
        self.replace_occurrences(event).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_place(&mut self, place: &Place) -> Result<Place> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO places ({PLACE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (natural_key) WHERE deleted_at IS NULL DO UPDATE SET
                street_address = COALESCE(NULLIF(places.street_address, ''), EXCLUDED.street_address),
                locality       = COALESCE(NULLIF(places.locality, ''), EXCLUDED.locality),
                region         = COALESCE(NULLIF(places.region, ''), EXCLUDED.region),
                postal_code    = COALESCE(NULLIF(places.postal_code, ''), EXCLUDED.postal_code),
                country        = COALESCE(NULLIF(places.country, ''), EXCLUDED.country),
                latitude       = COALESCE(places.latitude, EXCLUDED.latitude),
                longitude      = COALESCE(places.longitude, EXCLUDED.longitude),
                federation_uri = COALESCE(places.federation_uri, EXCLUDED.federation_uri),
                updated_at     = EXCLUDED.updated_at
            RETURNING {PLACE_COLUMNS}
            "#
        ))
        .bind(&place.id)
        .bind(&place.name)
        .bind(&place.street_address)
        .bind(&place.locality)
        .bind(&place.region)
        .bind(&place.postal_code)
        .bind(&place.country)
        .bind(place.latitude)
        .bind(place.longitude)
        .bind(&place.federation_uri)
        .bind(&place.natural_key)
        .bind(place.deleted_at)
        .bind(place.created_at)
        .bind(place.updated_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_write_err)?;
        place_from_row(&row)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_place(&mut self, id: &str) -> Result<Option<Place>> {
        let row = sqlx::query(&format!("SELECT {PLACE_COLUMNS} FROM places WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(place_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn find_place_by_federation_uri(&mut self, uri: &str) -> Result<Option<Place>> {
        let row = sqlx::query(&format!(
            "SELECT {PLACE_COLUMNS} FROM places \
             WHERE deleted_at IS NULL AND federation_uri = $1 LIMIT 1"
        ))
        .bind(uri)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(place_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn update_place(&mut self, place: &Place) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE places SET
                name = $2, street_address = $3, locality = $4, region = $5, postal_code = $6,
                country = $7, latitude = $8, longitude = $9, federation_uri = $10,
                natural_key = $11, deleted_at = $12, updated_at = $13
             WHERE id = $1
            "#,
        )
        .bind(&place.id)
        .bind(&place.name)
        .bind(&place.street_address)
        .bind(&place.locality)
        .bind(&place.region)
        .bind(&place.postal_code)
        .bind(&place.country)
        .bind(place.latitude)
        .bind(place.longitude)
        .bind(&place.federation_uri)
        .bind(&place.natural_key)
        .bind(place.deleted_at)
        .bind(place.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_err)?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("place {}", place.id)));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_organization(&mut self, org: &Organization) -> Result<Organization> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO organizations ({ORGANIZATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (natural_key) WHERE deleted_at IS NULL DO UPDATE SET
                url            = COALESCE(NULLIF(organizations.url, ''), EXCLUDED.url),
                email          = COALESCE(NULLIF(organizations.email, ''), EXCLUDED.email),
                locality       = COALESCE(NULLIF(organizations.locality, ''), EXCLUDED.locality),
                region         = COALESCE(NULLIF(organizations.region, ''), EXCLUDED.region),
                country        = COALESCE(NULLIF(organizations.country, ''), EXCLUDED.country),
                federation_uri = COALESCE(organizations.federation_uri, EXCLUDED.federation_uri),
                updated_at     = EXCLUDED.updated_at
            RETURNING {ORGANIZATION_COLUMNS}
            "#
        ))
        .bind(&org.id)
        .bind(&org.name)
        .bind(&org.url)
        .bind(&org.email)
        .bind(&org.locality)
        .bind(&org.region)
        .bind(&org.country)
        .bind(&org.federation_uri)
        .bind(&org.natural_key)
        .bind(org.deleted_at)
        .bind(org.created_at)
        .bind(org.updated_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_write_err)?;
        organization_from_row(&row)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_organization(&mut self, id: &str) -> Result<Option<Organization>> {
        let row = sqlx::query(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(organization_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn find_organization_by_federation_uri(
        &mut self,
        uri: &str,
    ) -> Result<Option<Organization>> {
        let row = sqlx::query(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations \
             WHERE deleted_at IS NULL AND federation_uri = $1 LIMIT 1"
        ))
        .bind(uri)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(organization_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn update_organization(&mut self, org: &Organization) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE organizations SET
                name = $2, url = $3, email = $4, locality = $5, region = $6, country = $7,
                federation_uri = $8, natural_key = $9, deleted_at = $10, updated_at = $11
             WHERE id = $1
            "#,
        )
        .bind(&org.id)
        .bind(&org.name)
        .bind(&org.url)
        .bind(&org.email)
        .bind(&org.locality)
        .bind(&org.region)
        .bind(&org.country)
        .bind(&org.federation_uri)
        .bind(&org.natural_key)
        .bind(org.deleted_at)
        .bind(org.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_err)?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("organization {}", org.id)));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn insert_tombstone(&mut self, tombstone: &Tombstone) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tombstones (kind, entity_id, uri, deleted_at, reason, superseded_by, snapshot)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (kind, entity_id) DO NOTHING
            "#,
        )
        .bind(tombstone.kind.as_str())
        .bind(&tombstone.entity_id)
        .bind(&tombstone.uri)
        .bind(tombstone.deleted_at)
        .bind(&tombstone.reason)
        .bind(&tombstone.superseded_by)
        .bind(Json(&tombstone.snapshot))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_tombstone(&mut self, kind: EntityKind, id: &str) -> Result<Option<Tombstone>> {
        let row = sqlx::query(
            r#"
            SELECT kind, entity_id, uri, deleted_at, reason, superseded_by, snapshot
              FROM tombstones
             WHERE kind = $1 AND entity_id = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(tombstone_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn insert_idempotency_key(&mut self, key: &IdempotencyKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, request_hash, event_id, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&key.key)
        .bind(&key.request_hash)
        .bind(&key.event_id)
        .bind(key.created_at)
        .bind(key.expires_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_idempotency_key(&mut self, key: &str) -> Result<Option<IdempotencyKey>> {
        let row = sqlx::query(
            r#"
            SELECT key, request_hash, event_id, created_at, expires_at
              FROM idempotency_keys
             WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|r| -> Result<IdempotencyKey> {
            Ok(IdempotencyKey {
                key: r.try_get("key")?,
                request_hash: r.try_get("request_hash")?,
                event_id: r.try_get("event_id")?,
                created_at: r.try_get("created_at")?,
                expires_at: r.try_get("expires_at")?,
            })
        })
        .transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn complete_idempotency_key(&mut self, key: &str, event_id: &str) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE idempotency_keys SET event_id = $2
             WHERE key = $1 AND (event_id IS NULL OR event_id = $2)
            "#,
        )
        .bind(key)
        .bind(event_id)
        .execute(&mut *self.tx)
        .await?;
        if res.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_idempotency_key(key).await? {
            Some(_) => Err(Error::conflict("idempotency_keys_event_id")),
            None => Err(Error::NotFound(format!("idempotency key {key}"))),
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn delete_idempotency_key(&mut self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn purge_idempotency_keys(&mut self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        Ok(res.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn insert_review_entry(&mut self, entry: &ReviewEntry) -> Result<()> {
        let (source_key, external_id) = split_source(&entry.source);
        sqlx::query(&format!(
            "INSERT INTO review_queue ({REVIEW_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        ))
        .bind(&entry.id)
        .bind(&entry.event_id)
        .bind(Json(&entry.original_payload))
        .bind(Json(&entry.normalized_payload))
        .bind(Json(&entry.warnings))
        .bind(entry.confidence)
        .bind(source_key)
        .bind(external_id)
        .bind(&entry.fingerprint)
        .bind(entry.event_start)
        .bind(entry.event_end)
        .bind(entry.status.as_str())
        .bind(&entry.reviewed_by)
        .bind(entry.reviewed_at)
        .bind(&entry.review_notes)
        .bind(&entry.rejection_reason)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_review_entry(&mut self, id: &str) -> Result<Option<ReviewEntry>> {
        let row = sqlx::query(&format!("SELECT {REVIEW_COLUMNS} FROM review_queue WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(review_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn find_pending_review_for_event(
        &mut self,
        event_id: &str,
    ) -> Result<Option<ReviewEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_queue \
             WHERE event_id = $1 AND status = 'pending' ORDER BY id ASC LIMIT 1"
        ))
        .bind(event_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(review_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn find_rejected_review(
        &mut self,
        source: Option<&SourceIdentity>,
        fingerprint: Option<&str>,
    ) -> Result<Option<ReviewEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM review_queue \
             WHERE status = 'rejected' \
               AND ((source_key = $1 AND source_external_id = $2) OR fingerprint = $3) \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(source.map(|s| s.key.as_str()))
        .bind(source.map(|s| s.external_id.as_str()))
        .bind(fingerprint)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(review_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn transition_review(
        &mut self,
        id: &str,
        transition: &ReviewTransition,
    ) -> Result<Option<ReviewEntry>> {
        let row = sqlx::query(&format!(
            "UPDATE review_queue SET \
                 status = $2, reviewed_by = $3, reviewed_at = $4, review_notes = $5, \
                 rejection_reason = $6, updated_at = $4 \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {REVIEW_COLUMNS}"
        ))
        .bind(id)
        .bind(transition.status.as_str())
        .bind(&transition.reviewed_by)
        .bind(transition.reviewed_at)
        .bind(&transition.review_notes)
        .bind(&transition.rejection_reason)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(Some(review_from_row(&row)?)),
            None => {
                let exists = sqlx::query("SELECT 1 FROM review_queue WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *self.tx)
                    .await?;
                if exists.is_some() {
                    Ok(None)
                } else {
                    Err(Error::NotFound(format!("review entry {id}")))
                }
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(entry_id = %entry.id))]
    async fn refresh_pending_review(&mut self, entry: &ReviewEntry) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE review_queue SET \
                 original_payload = $2, normalized_payload = $3, warnings = $4, \
                 confidence = $5, event_start = $6, event_end = $7, updated_at = $8 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(&entry.id)
        .bind(Json(&entry.original_payload))
        .bind(Json(&entry.normalized_payload))
        .bind(Json(&entry.warnings))
        .bind(entry.confidence)
        .bind(entry.event_start)
        .bind(entry.event_end)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await?;
        if res.rows_affected() > 0 {
            return Ok(true);
        }
        let exists = sqlx::query("SELECT 1 FROM review_queue WHERE id = $1")
            .bind(&entry.id)
            .fetch_optional(&mut *self.tx)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("review entry {}", entry.id))),
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn list_review_entries(
        &mut self,
        status: Option<ReviewStatus>,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ReviewEntry>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {REVIEW_COLUMNS} FROM review_queue WHERE TRUE"));
        if let Some(status) = status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(after) = after {
            qb.push(" AND id > ").push_bind(after.to_string());
        }
        qb.push(" ORDER BY id ASC LIMIT ").push_bind(limit as i64);

        let rows = qb.build().fetch_all(&mut *self.tx).await?;
        rows.iter().map(review_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn purge_rejected_reviews(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM review_queue
             WHERE status = 'rejected' AND COALESCE(event_end, event_start) < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_node(&mut self, domain: &str) -> Result<Option<FederationNode>> {
        let row = sqlx::query(
            r#"
            SELECT domain, name, base_url, trust_level, sync_enabled, is_online, last_sync_at,
                   created_at, updated_at
              FROM federation_nodes
             WHERE domain = $1
            "#,
        )
        .bind(domain)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|r| -> Result<FederationNode> {
            Ok(FederationNode {
                domain: r.try_get("domain")?,
                name: r.try_get("name")?,
                base_url: r.try_get("base_url")?,
                trust_level: r.try_get("trust_level")?,
                sync_enabled: r.try_get("sync_enabled")?,
                is_online: r.try_get("is_online")?,
                last_sync_at: r.try_get("last_sync_at")?,
                created_at: r.try_get("created_at")?,
                updated_at: r.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_node(&mut self, node: &FederationNode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO federation_nodes
                (domain, name, base_url, trust_level, sync_enabled, is_online, last_sync_at,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (domain) DO UPDATE SET
                name = EXCLUDED.name,
                base_url = EXCLUDED.base_url,
                trust_level = EXCLUDED.trust_level,
                sync_enabled = EXCLUDED.sync_enabled,
                is_online = EXCLUDED.is_online,
                last_sync_at = EXCLUDED.last_sync_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&node.domain)
        .bind(&node.name)
        .bind(&node.base_url)
        .bind(node.trust_level)
        .bind(node.sync_enabled)
        .bind(node.is_online)
        .bind(node.last_sync_at)
        .bind(node.created_at)
        .bind(node.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn put_batch(&mut self, batch: &BatchStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_batches
                (id, state, total, created, duplicates, needs_review, failed, results,
                 submitted_at, completed_at, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                created = EXCLUDED.created,
                duplicates = EXCLUDED.duplicates,
                needs_review = EXCLUDED.needs_review,
                failed = EXCLUDED.failed,
                results = EXCLUDED.results,
                completed_at = EXCLUDED.completed_at,
                error = EXCLUDED.error
            "#,
        )
        .bind(&batch.id)
        .bind(batch.state.as_str())
        .bind(batch.total as i64)
        .bind(batch.created as i64)
        .bind(batch.duplicates as i64)
        .bind(batch.needs_review as i64)
        .bind(batch.failed as i64)
        .bind(Json(&batch.results))
        .bind(batch.submitted_at)
        .bind(batch.completed_at)
        .bind(&batch.error)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn get_batch(&mut self, id: &str) -> Result<Option<BatchStatus>> {
        let row = sqlx::query(
            r#"
            SELECT id, state, total, created, duplicates, needs_review, failed, results,
                   submitted_at, completed_at, error
              FROM ingest_batches
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|r| -> Result<BatchStatus> {
            let state: String = r.try_get("state")?;
            let results: Json<Vec<BatchItemResult>> = r.try_get("results")?;
            Ok(BatchStatus {
                id: r.try_get("id")?,
                state: BatchState::parse(&state)?,
                total: count(&r, "total")?,
                created: count(&r, "created")?,
                duplicates: count(&r, "duplicates")?,
                needs_review: count(&r, "needs_review")?,
                failed: count(&r, "failed")?,
                results: results.0,
                submitted_at: r.try_get("submitted_at")?,
                completed_at: r.try_get("completed_at")?,
                error: r.try_get("error")?,
            })
        })
        .transpose()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn purge_batches(&mut self, completed_before: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM ingest_batches \
             WHERE state IN ('completed', 'failed') AND completed_at < $1",
        )
        .bind(completed_before)
        .execute(&mut *self.tx)
        .await?;
        Ok(res.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_write_err)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn split_source(source: &Option<SourceIdentity>) -> (Option<&str>, Option<&str>) {
    match source {
        Some(s) => (Some(s.key.as_str()), Some(s.external_id.as_str())),
        None => (None, None),
    }
}

fn join_source(key: Option<String>, external_id: Option<String>) -> Option<SourceIdentity> {
    match (key, external_id) {
        (Some(key), Some(external_id)) => Some(SourceIdentity { key, external_id }),
        _ => None,
    }
}

fn count(row: &PgRow, column: &str) -> Result<usize> {
    let v: i64 = row.try_get(column)?;
    usize::try_from(v).map_err(|_| Error::message(format!("negative count in {column}")))
}

fn event_from_row(row: &PgRow) -> Result<Event> {
    let keywords: Json<Vec<String>> = row.try_get("keywords")?;
    let in_language: Json<Vec<String>> = row.try_get("in_language")?;
    let extensions: Json<serde_json::Map<String, serde_json::Value>> =
        row.try_get("extensions")?;
    let attendance_mode: String = row.try_get("attendance_mode")?;
    let lifecycle: String = row.try_get("lifecycle")?;

    Ok(Event {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        url: row.try_get("url")?,
        image_url: row.try_get("image_url")?,
        keywords: keywords.0,
        in_language: in_language.0,
        is_accessible_for_free: row.try_get("is_accessible_for_free")?,
        attendance_mode: AttendanceMode::parse(&attendance_mode)?,
        event_status: row.try_get("event_status")?,
        license_url: row.try_get("license_url")?,
        lifecycle: LifecycleState::parse(&lifecycle)?,
        confidence: row.try_get("confidence")?,
        organizer_id: row.try_get("organizer_id")?,
        venue_id: row.try_get("venue_id")?,
        virtual_url: row.try_get("virtual_url")?,
        source: join_source(
            row.try_get("source_key")?,
            row.try_get("source_external_id")?,
        ),
        fingerprint: row.try_get("fingerprint")?,
        federation_uri: row.try_get("federation_uri")?,
        origin_node: row.try_get("origin_node")?,
        extensions: extensions.0,
        deleted_at: row.try_get("deleted_at")?,
        deletion_reason: row.try_get("deletion_reason")?,
        merged_into: row.try_get("merged_into")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        occurrences: Vec::new(),
    })
}

fn occurrence_from_row(row: &PgRow) -> Result<Occurrence> {
    Ok(Occurrence {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        start: row.try_get("start_time")?,
        end: row.try_get("end_time")?,
        door_time: row.try_get("door_time")?,
        timezone: row.try_get("timezone")?,
        venue_id: row.try_get("venue_id")?,
        virtual_url: row.try_get("virtual_url")?,
        ticket_url: row.try_get("ticket_url")?,
        price_min: row.try_get("price_min")?,
        price_max: row.try_get("price_max")?,
        currency: row.try_get("currency")?,
    })
}

fn place_from_row(row: &PgRow) -> Result<Place> {
    Ok(Place {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        street_address: row.try_get("street_address")?,
        locality: row.try_get("locality")?,
        region: row.try_get("region")?,
        postal_code: row.try_get("postal_code")?,
        country: row.try_get("country")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        federation_uri: row.try_get("federation_uri")?,
        natural_key: row.try_get("natural_key")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn organization_from_row(row: &PgRow) -> Result<Organization> {
    Ok(Organization {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        email: row.try_get("email")?,
        locality: row.try_get("locality")?,
        region: row.try_get("region")?,
        country: row.try_get("country")?,
        federation_uri: row.try_get("federation_uri")?,
        natural_key: row.try_get("natural_key")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tombstone_from_row(row: &PgRow) -> Result<Tombstone> {
    let kind: String = row.try_get("kind")?;
    let snapshot: Json<serde_json::Value> = row.try_get("snapshot")?;
    Ok(Tombstone {
        kind: EntityKind::parse(&kind)?,
        entity_id: row.try_get("entity_id")?,
        uri: row.try_get("uri")?,
        deleted_at: row.try_get("deleted_at")?,
        reason: row.try_get("reason")?,
        superseded_by: row.try_get("superseded_by")?,
        snapshot: snapshot.0,
    })
}

fn review_from_row(row: &PgRow) -> Result<ReviewEntry> {
    let original: Json<serde_json::Value> = row.try_get("original_payload")?;
    let normalized: Json<serde_json::Value> = row.try_get("normalized_payload")?;
    let warnings: Json<Vec<Warning>> = row.try_get("warnings")?;
    let status: String = row.try_get("status")?;
    Ok(ReviewEntry {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        original_payload: original.0,
        normalized_payload: normalized.0,
        warnings: warnings.0,
        confidence: row.try_get("confidence")?,
        source: join_source(
            row.try_get("source_key")?,
            row.try_get("source_external_id")?,
        ),
        fingerprint: row.try_get("fingerprint")?,
        event_start: row.try_get("event_start")?,
        event_end: row.try_get("event_end")?,
        status: ReviewStatus::parse(&status)?,
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: row.try_get("reviewed_at")?,
        review_notes: row.try_get("review_notes")?,
        rejection_reason: row.try_get("rejection_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
