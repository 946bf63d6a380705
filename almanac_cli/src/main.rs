mod cli;

use std::sync::Arc;

use almanac_core::catalog::models::{EntityKind, ReviewStatus};
use almanac_core::catalog::{CatalogStore, PgCatalog};
use almanac_core::candidate::CandidateEvent;
use almanac_core::config::{AlmanacConfig, PostgresConfig};
use almanac_core::federation::{FederationSync, NodeRegistration};
use almanac_core::idempotency::IdempotencyCoordinator;
use almanac_core::ingest::{BatchIngestor, IngestOptions, IngestService};
use almanac_core::lifecycle::LifecycleService;
use almanac_core::models::{Actor, RequestContext};
use almanac_core::retention::Janitor;
use almanac_core::review::{ReviewCorrections, ReviewQueue};
use clap::Parser;
use cli::{Cli, Commands, NodeAction, ReviewAction};
use serde::Serialize;

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

fn redact(s: &str) -> String {
    match s.find('@') {
        Some(at) => match s.find("://") {
            Some(scheme) => format!("{}***{}", &s[..scheme + 3], &s[at..]),
            None => "***".to_string(),
        },
        None => s.to_string(),
    }
}

async fn connect(cfg: &AlmanacConfig) -> anyhow::Result<PgCatalog> {
    let Some(pg) = &cfg.postgres else {
        anyhow::bail!("no database configured (set --database-url or ALMANAC_DATABASE_URL)");
    };
    Ok(PgCatalog::connect(pg).await?)
}

#[tokio::main]
#[tracing::instrument(level = "info")]
async fn main() -> anyhow::Result<()> {
    almanac_core::o11y::init_from_env()?;
    let cli = Cli::parse();

    let mut cfg = AlmanacConfig::from_env()?;
    if let Some(url) = cli.database_url.clone() {
        cfg.postgres = Some(PostgresConfig {
            url,
            max_connections: 5,
            acquire_timeout: std::time::Duration::from_secs(10),
        });
    }
    cfg.validate()?;

    let system = || RequestContext::system("cli").with_timeout(cfg.request_timeout);

    match cli.command {
        Commands::Migrate => {
            let db = connect(&cfg).await?;
            db.migrate().await?;
            tracing::info!("catalog migrations applied");
        }
        Commands::Check => match &cfg.postgres {
            Some(pg) => match PgCatalog::connect(pg).await {
                Ok(db) => match db.begin().await {
                    Ok(tx) => {
                        tx.rollback().await?;
                        println!("postgres: ok");
                    }
                    Err(e) => println!("postgres: error ({e})"),
                },
                Err(e) => println!("postgres: error ({e})"),
            },
            None => println!("postgres: not configured"),
        },
        Commands::Config => {
            let v = serde_json::json!({
                "node_domain": cfg.ingest.node_domain,
                "default_timezone": cfg.ingest.default_timezone,
                "database_url": cfg.postgres.as_ref().map(|p| redact(&p.url)),
                "validation": {
                    "require_image": cfg.validation.require_image,
                    "require_description": cfg.validation.require_description,
                    "require_venue_locality": cfg.validation.require_venue_locality,
                    "max_future_days": cfg.validation.max_future_days,
                    "review_threshold": cfg.validation.review_threshold,
                },
                "max_batch_size": cfg.ingest.max_batch_size,
                "idempotency_ttl_secs": cfg.idempotency.ttl.as_secs(),
                "rejection_grace_secs": cfg.retention.rejection_grace.as_secs(),
                "request_timeout_ms": cfg.request_timeout.as_millis() as u64,
            });
            print_json(&v)?;
        }
        Commands::Ingest { path, token, stage } => {
            let store: Arc<dyn CatalogStore> = Arc::new(connect(&cfg).await?);
            let service = ingest_service(&cfg, store);
            let candidate: CandidateEvent = read_json(&path).await?;
            let options = IngestOptions { stage_only: stage };
            let ctx = system();
            let result = match token.as_deref() {
                Some(token) => {
                    service
                        .ingest_with_idempotency(&ctx, &candidate, token, options)
                        .await?
                }
                None => service.ingest(&ctx, &candidate, options).await?,
            };
            print_json(&result)?;
        }
        Commands::Batch { path, stage } => {
            let store: Arc<dyn CatalogStore> = Arc::new(connect(&cfg).await?);
            let candidates: Vec<CandidateEvent> = read_json(&path).await?;
            let handle = BatchIngestor::start(ingest_service(&cfg, store));
            let ctx = RequestContext::system("cli");
            let batch_id = handle
                .ingestor()
                .submit(&ctx, candidates, IngestOptions { stage_only: stage })
                .await?;
            // The worker runs in this process; wait for it before exiting.
            let status = loop {
                let status = handle.ingestor().status(&ctx, &batch_id).await?;
                if status.state.is_terminal() {
                    break status;
                }
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            };
            handle.shutdown().await;
            print_json(&status)?;
        }
        Commands::Sync { path, token } => {
            let store: Arc<dyn CatalogStore> = Arc::new(connect(&cfg).await?);
            let payload: serde_json::Value = read_json(&path).await?;
            let sync = FederationSync::new(
                store.clone(),
                IdempotencyCoordinator::new(store, cfg.idempotency.clone()),
            );
            let result = sync.sync_event(&system(), &payload, token.as_deref()).await?;
            print_json(&result)?;
        }
        Commands::Review { action } => {
            let store: Arc<dyn CatalogStore> = Arc::new(connect(&cfg).await?);
            let queue = ReviewQueue::new(store, cfg.ingest.node_domain.clone());
            match action {
                ReviewAction::List {
                    status,
                    cursor,
                    limit,
                } => {
                    let status = ReviewStatus::parse(&status)?;
                    let page = queue
                        .list(&system(), Some(status), cursor.as_deref(), limit)
                        .await?;
                    print_json(&page)?;
                }
                ReviewAction::Approve {
                    entry_id,
                    reviewer,
                    notes,
                } => {
                    let ctx = moderator(&reviewer, &cfg);
                    let decision = queue
                        .approve(&ctx, &entry_id, &reviewer, notes.as_deref())
                        .await?;
                    print_json(&decision)?;
                }
                ReviewAction::Reject {
                    entry_id,
                    reviewer,
                    reason,
                } => {
                    let ctx = moderator(&reviewer, &cfg);
                    let decision = queue.reject(&ctx, &entry_id, &reviewer, &reason).await?;
                    print_json(&decision)?;
                }
                ReviewAction::Fix {
                    entry_id,
                    reviewer,
                    corrections,
                    notes,
                } => {
                    let corrections: ReviewCorrections = read_json(&corrections).await?;
                    let ctx = moderator(&reviewer, &cfg);
                    let decision = queue
                        .fix(&ctx, &entry_id, &reviewer, &corrections, notes.as_deref())
                        .await?;
                    print_json(&decision)?;
                }
            }
        }
        Commands::Nodes { action } => {
            let store: Arc<dyn CatalogStore> = Arc::new(connect(&cfg).await?);
            let registry = almanac_core::federation::NodeRegistry::new(store);
            let ctx = system();
            let node = match action {
                NodeAction::Add {
                    domain,
                    base_url,
                    name,
                    trust_level,
                    disabled,
                } => {
                    registry
                        .register_node(
                            &ctx,
                            NodeRegistration {
                                domain,
                                name,
                                base_url,
                                trust_level,
                                sync_enabled: !disabled,
                            },
                        )
                        .await?
                }
                NodeAction::Enable { domain } => {
                    registry.set_sync_enabled(&ctx, &domain, true).await?
                }
                NodeAction::Disable { domain } => {
                    registry.set_sync_enabled(&ctx, &domain, false).await?
                }
                NodeAction::Show { domain } => registry.get_node(&ctx, &domain).await?,
            };
            print_json(&node)?;
        }
        Commands::Delete { event_id, reason } => {
            let store: Arc<dyn CatalogStore> = Arc::new(connect(&cfg).await?);
            let lifecycle = LifecycleService::new(store, cfg.ingest.node_domain.clone());
            print_json(&lifecycle.delete_event(&system(), &event_id, &reason).await?)?;
        }
        Commands::Merge { primary, duplicate } => {
            let store: Arc<dyn CatalogStore> = Arc::new(connect(&cfg).await?);
            let lifecycle = LifecycleService::new(store, cfg.ingest.node_domain.clone());
            print_json(&lifecycle.merge_events(&system(), &primary, &duplicate).await?)?;
        }
        Commands::Tombstone { kind, id } => {
            let store: Arc<dyn CatalogStore> = Arc::new(connect(&cfg).await?);
            let lifecycle = LifecycleService::new(store, cfg.ingest.node_domain.clone());
            let kind = EntityKind::parse(&kind)?;
            print_json(&lifecycle.tombstone(&system(), kind, &id).await?)?;
        }
        Commands::Purge => {
            let store: Arc<dyn CatalogStore> = Arc::new(connect(&cfg).await?);
            let janitor = Janitor::new(store, cfg.retention.clone());
            let report = janitor.purge_expired(&system(), chrono::Utc::now()).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}

fn ingest_service(cfg: &AlmanacConfig, store: Arc<dyn CatalogStore>) -> IngestService {
    IngestService::new(
        store.clone(),
        IdempotencyCoordinator::new(store, cfg.idempotency.clone()),
        cfg.validation.clone(),
        cfg.ingest.clone(),
    )
}

fn moderator(reviewer: &str, cfg: &AlmanacConfig) -> RequestContext {
    RequestContext::new(Actor::Moderator {
        id: reviewer.to_string(),
    })
    .with_timeout(cfg.request_timeout)
}
