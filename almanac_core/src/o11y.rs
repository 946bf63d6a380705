use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive. Falls back to `RUST_LOG`, then `info`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            filter: None,
        }
    }
}

impl LogConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let format = match std::env::var("ALMANAC_LOG_FORMAT") {
            Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
                "" | "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                other => {
                    return Err(Error::InvalidInput(format!(
                        "ALMANAC_LOG_FORMAT must be json or pretty, got {other}"
                    )))
                }
            },
            Err(_) => LogFormat::Json,
        };
        let filter = std::env::var("ALMANAC_LOG")
            .ok()
            .filter(|v| !v.trim().is_empty());
        Ok(Self { format, filter })
    }
}

/// Install the global tracing subscriber. JSON to stdout unless configured
/// otherwise.
#[tracing::instrument(level = "info", skip_all)]
pub fn init_tracing(cfg: &LogConfig) -> Result<()> {
    let filter = match &cfg.filter {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|e| Error::InvalidInput(format!("invalid log filter: {e}")))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let res = match cfg.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };
    res.map_err(|e| Error::backend("tracing already initialized", e))
}

#[tracing::instrument(level = "info", skip_all)]
pub fn init_from_env() -> Result<()> {
    init_tracing(&LogConfig::from_env()?)
}
