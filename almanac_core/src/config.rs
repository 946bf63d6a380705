use std::time::Duration;

use crate::{Error, Result};

/// Upper bound for `max_future_days`; a century is already generous.
pub const MAX_FUTURE_DAYS_LIMIT: i64 = 36_500;

/// Which candidate fields are mandatory and how strictly they are scored.
///
/// Owned by the deployment, consumed by ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationConfig {
    pub require_image: bool,
    pub require_description: bool,
    /// Flag venues given only by name (no id, address or locality).
    pub require_venue_locality: bool,
    /// Starts further out than this are flagged as suspicious.
    pub max_future_days: i64,
    /// Submissions scoring below this go to review.
    pub review_threshold: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            require_image: false,
            require_description: true,
            require_venue_locality: false,
            max_future_days: 730,
            review_threshold: 0.6,
        }
    }
}

impl ValidationConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.max_future_days <= 0 {
            return Err(Error::InvalidInput(
                "max_future_days must be > 0".to_string(),
            ));
        }
        if self.max_future_days > MAX_FUTURE_DAYS_LIMIT {
            return Err(Error::InvalidInput(format!(
                "max_future_days must be <= {MAX_FUTURE_DAYS_LIMIT}"
            )));
        }
        if !(0.0..=1.0).contains(&self.review_threshold) {
            return Err(Error::InvalidInput(
                "review_threshold must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Public domain of this node, used for canonical URIs.
    pub node_domain: String,
    /// Timezone label recorded on occurrences that don't name one.
    pub default_timezone: String,
    pub max_batch_size: usize,
    pub batch_queue_capacity: usize,
    /// Per-item deadline inside a batch.
    pub batch_item_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            node_domain: "localhost".to_string(),
            default_timezone: "UTC".to_string(),
            max_batch_size: 100,
            batch_queue_capacity: 64,
            batch_item_timeout: Duration::from_secs(30),
        }
    }
}

impl IngestConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.node_domain.trim().is_empty() {
            return Err(Error::InvalidInput("node_domain is empty".to_string()));
        }
        if self.default_timezone.trim().is_empty() {
            return Err(Error::InvalidInput("default_timezone is empty".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(Error::InvalidInput("max_batch_size must be > 0".to_string()));
        }
        if self.batch_queue_capacity == 0 {
            return Err(Error::InvalidInput(
                "batch_queue_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyConfig {
    /// How long a token keeps answering with its original result.
    pub ttl: Duration,
    /// Poll interval while another request holds the token.
    pub in_flight_poll: Duration,
    /// Give up waiting on an in-flight token after this long.
    pub in_flight_max_wait: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            in_flight_poll: Duration::from_millis(50),
            in_flight_max_wait: Duration::from_secs(5),
        }
    }
}

impl IdempotencyConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(Error::InvalidInput("idempotency ttl must be > 0".to_string()));
        }
        if self.in_flight_poll.is_zero() {
            return Err(Error::InvalidInput("in_flight_poll must be > 0".to_string()));
        }
        if self.in_flight_max_wait < self.in_flight_poll {
            return Err(Error::InvalidInput(
                "in_flight_max_wait must be >= in_flight_poll".to_string(),
            ));
        }
        Ok(())
    }
}

/// Garbage collection of idempotency keys, rejection memory and batch
/// results.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionConfig {
    /// Rejected review entries are kept until this long after the
    /// rejected event ended (or started, when it had no end).
    pub rejection_grace: Duration,
    /// Completed batch status records are kept this long.
    pub batch_result_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            rejection_grace: Duration::from_secs(7 * 24 * 60 * 60),
            batch_result_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RetentionConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidInput("sweep_interval must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Top-level configuration. `from_env` reads `ALMANAC_*` variables and
/// falls back to defaults for anything unset.
#[derive(Debug, Clone, PartialEq)]
pub struct AlmanacConfig {
    pub validation: ValidationConfig,
    pub ingest: IngestConfig,
    pub idempotency: IdempotencyConfig,
    pub retention: RetentionConfig,
    pub postgres: Option<PostgresConfig>,
    /// Default deadline applied to requests issued by the CLI and workers.
    pub request_timeout: Duration,
}

impl Default for AlmanacConfig {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
            ingest: IngestConfig::default(),
            idempotency: IdempotencyConfig::default(),
            retention: RetentionConfig::default(),
            postgres: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl AlmanacConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let validation = ValidationConfig {
            require_image: env_bool("ALMANAC_REQUIRE_IMAGE")?
                .unwrap_or(d.validation.require_image),
            require_description: env_bool("ALMANAC_REQUIRE_DESCRIPTION")?
                .unwrap_or(d.validation.require_description),
            require_venue_locality: env_bool("ALMANAC_REQUIRE_VENUE_LOCALITY")?
                .unwrap_or(d.validation.require_venue_locality),
            max_future_days: env_parse("ALMANAC_MAX_FUTURE_DAYS")?
                .unwrap_or(d.validation.max_future_days),
            review_threshold: env_parse("ALMANAC_REVIEW_THRESHOLD")?
                .unwrap_or(d.validation.review_threshold),
        };

        let ingest = IngestConfig {
            node_domain: std::env::var("ALMANAC_NODE_DOMAIN")
                .unwrap_or(d.ingest.node_domain),
            default_timezone: std::env::var("ALMANAC_DEFAULT_TIMEZONE")
                .unwrap_or(d.ingest.default_timezone),
            max_batch_size: env_parse("ALMANAC_MAX_BATCH_SIZE")?
                .unwrap_or(d.ingest.max_batch_size),
            batch_queue_capacity: env_parse("ALMANAC_BATCH_QUEUE_CAPACITY")?
                .unwrap_or(d.ingest.batch_queue_capacity),
            batch_item_timeout: env_parse("ALMANAC_BATCH_ITEM_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.ingest.batch_item_timeout),
        };

        let idempotency = IdempotencyConfig {
            ttl: env_parse("ALMANAC_IDEMPOTENCY_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.idempotency.ttl),
            in_flight_poll: env_parse("ALMANAC_IDEMPOTENCY_POLL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.idempotency.in_flight_poll),
            in_flight_max_wait: env_parse("ALMANAC_IDEMPOTENCY_MAX_WAIT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.idempotency.in_flight_max_wait),
        };

        let retention = RetentionConfig {
            rejection_grace: env_parse("ALMANAC_REJECTION_GRACE_DAYS")?
                .map(|days: u64| Duration::from_secs(days * 24 * 60 * 60))
                .unwrap_or(d.retention.rejection_grace),
            batch_result_ttl: env_parse("ALMANAC_BATCH_RESULT_TTL_DAYS")?
                .map(|days: u64| Duration::from_secs(days * 24 * 60 * 60))
                .unwrap_or(d.retention.batch_result_ttl),
            sweep_interval: env_parse("ALMANAC_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.retention.sweep_interval),
        };

        let postgres = match std::env::var("ALMANAC_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
        {
            Ok(url) => Some(PostgresConfig {
                url,
                max_connections: env_parse("ALMANAC_DB_MAX_CONNECTIONS")?.unwrap_or(10),
                acquire_timeout: env_parse("ALMANAC_DB_ACQUIRE_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(10)),
            }),
            Err(_) => None,
        };

        let cfg = Self {
            validation,
            ingest,
            idempotency,
            retention,
            postgres,
            request_timeout: env_parse("ALMANAC_REQUEST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.request_timeout),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        self.validation.validate()?;
        self.ingest.validate()?;
        self.idempotency.validate()?;
        self.retention.validate()?;
        if let Some(pg) = &self.postgres {
            if pg.url.trim().is_empty() {
                return Err(Error::InvalidInput("database url is empty".to_string()));
            }
            if pg.max_connections == 0 {
                return Err(Error::InvalidInput(
                    "max_connections must be > 0".to_string(),
                ));
            }
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidInput("request_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("{key} is not a valid value: {raw}"))),
        _ => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::InvalidInput(format!("{key} must be a boolean: {raw}"))),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AlmanacConfig::default().validate().unwrap();
        assert_eq!(ValidationConfig::default().max_future_days, 730);
        assert_eq!(IngestConfig::default().max_batch_size, 100);
        assert_eq!(
            IdempotencyConfig::default().ttl,
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let cfg = ValidationConfig {
            review_threshold: 1.5,
            ..ValidationConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn rejects_future_horizon_beyond_a_century() {
        let cfg = ValidationConfig {
            max_future_days: i64::MAX,
            ..ValidationConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidInput(_))));

        let at_limit = ValidationConfig {
            max_future_days: MAX_FUTURE_DAYS_LIMIT,
            ..ValidationConfig::default()
        };
        at_limit.validate().unwrap();
    }

    #[test]
    fn rejects_wait_shorter_than_poll() {
        let cfg = IdempotencyConfig {
            in_flight_poll: Duration::from_millis(100),
            in_flight_max_wait: Duration::from_millis(10),
            ..IdempotencyConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_batch_size_is_invalid() {
        let cfg = IngestConfig {
            max_batch_size: 0,
            ..IngestConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
