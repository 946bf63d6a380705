use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "almanac", version, about = "Event catalog ingestion and federation")]
pub struct Cli {
    /// Postgres URL (else ALMANAC_DATABASE_URL / DATABASE_URL).
    #[arg(long, global = true, env = "ALMANAC_DATABASE_URL")]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create or update the catalog schema.
    Migrate,

    /// Health check the configured database.
    Check,

    /// Print the effective configuration (redacted secrets).
    Config,

    /// Ingest one candidate event from a JSON file.
    Ingest {
        path: PathBuf,

        /// Idempotency token; retries with the same token return the first result.
        #[arg(long)]
        token: Option<String>,

        /// Keep the event in draft instead of publishing it.
        #[arg(long)]
        stage: bool,
    },

    /// Ingest a JSON array of candidates as one batch and wait for the result.
    Batch {
        path: PathBuf,

        #[arg(long)]
        stage: bool,
    },

    /// Apply a federation payload (JSON-LD) from a peer node.
    Sync {
        path: PathBuf,

        #[arg(long)]
        token: Option<String>,
    },

    /// Moderate the review queue.
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Manage federation peers.
    Nodes {
        #[command(subcommand)]
        action: NodeAction,
    },

    /// Soft-delete an event, leaving a tombstone.
    Delete {
        event_id: String,

        #[arg(long)]
        reason: String,
    },

    /// Fold a duplicate event into a primary one.
    Merge { primary: String, duplicate: String },

    /// Show the tombstone of a deleted event, place or organization.
    Tombstone {
        /// event | place | organization
        kind: String,
        id: String,
    },

    /// Run one retention sweep.
    Purge,
}

#[derive(Debug, Subcommand)]
pub enum ReviewAction {
    List {
        /// pending | approved | rejected
        #[arg(long, default_value = "pending")]
        status: String,

        #[arg(long)]
        cursor: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
    Approve {
        entry_id: String,

        #[arg(long, env = "ALMANAC_REVIEWER")]
        reviewer: String,

        #[arg(long)]
        notes: Option<String>,
    },
    Reject {
        entry_id: String,

        #[arg(long, env = "ALMANAC_REVIEWER")]
        reviewer: String,

        #[arg(long)]
        reason: String,
    },
    /// Apply corrections from a JSON file (`startDate`, `endDate`, `name`,
    /// `description`, `image`, `url`) and publish.
    Fix {
        entry_id: String,

        #[arg(long, env = "ALMANAC_REVIEWER")]
        reviewer: String,

        #[arg(long)]
        corrections: PathBuf,

        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum NodeAction {
    Add {
        domain: String,

        #[arg(long)]
        base_url: String,

        #[arg(long, default_value = "")]
        name: String,

        #[arg(long, default_value = "0")]
        trust_level: i32,

        /// Register the node without accepting its events yet.
        #[arg(long)]
        disabled: bool,
    },
    Enable {
        domain: String,
    },
    Disable {
        domain: String,
    },
    Show {
        domain: String,
    },
}
