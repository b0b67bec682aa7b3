//! # Context Harness
//!
//! A hybrid retrieval-and-routing engine for curriculum question answering,
//! exposed as a single binary with two servers: the core Query API and the
//! session-aware gateway that sits in front of it.
//!
//! ## Architecture
//!
//! ```text
//! ctx ingest → relational store + lexical index + dense index
//! ctx serve core    → Query API (intent routing, retrieval, generation, verification)
//! ctx serve gateway  → session state, follow-up rewriting, forwards to core
//! ```
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration parsing and validation
//! - [`models`] — Core data types: `Chunk`, `Candidate`, `QueryResult`, `Intent`
//! - [`point_id`] — Deterministic UUID derivation for vector store point ids
//! - [`embedder`] — Embedding provider trait and local backends
//! - [`dense_index`] — Qdrant-backed vector search, fetch, and upsert
//! - [`lexical_index`] — Tantivy-backed BM25 keyword search
//! - [`relational_store`] — SQLite source of truth for chunk text and curriculum facts
//! - [`cross_encoder`] — Reranking
//! - [`mmr`] — Maximal marginal relevance diversification
//! - [`prompt`] — Token-budgeted prompt assembly
//! - [`generative`] — Generative provider trait and HTTP implementations
//! - [`intent`] — Pattern-based intent classifier
//! - [`orchestrator`] — Ties retrieval, routing, and generation together
//! - [`verifier`] — Post-hoc faithfulness checks
//! - [`gateway`] — Session-aware conversational layer in front of the Query API
//! - [`ingest`] — JSONL ingestion
//! - [`stats`] — Index health reporting
//! - [`server`] — Core Query API HTTP server
//! - [`db`] — SQLite connection management
//! - [`migrate`] — Database schema migrations
//! - [`progress`] — Ingest progress reporting

mod config;
mod cross_encoder;
mod db;
mod dense_index;
mod embedder;
#[cfg(feature = "local-embeddings-tract")]
mod embedder_tract;
mod gateway;
mod generative;
mod ingest;
mod intent;
mod lexical_index;
mod migrate;
mod mmr;
mod models;
mod orchestrator;
mod point_id;
mod progress;
mod prompt;
mod relational_store;
mod server;
mod stats;
mod verifier;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use progress::ProgressMode;

#[derive(Parser)]
#[command(
    name = "ctx",
    about = "Context Harness — a hybrid retrieval-and-routing engine for curriculum question answering",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/ctx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Ingest a JSONL file of chunks into the relational, lexical, and dense stores
    Ingest {
        /// Path to a JSONL file of `Chunk` records
        path: PathBuf,

        /// Force progress output format regardless of TTY detection
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Report index health: chunk/course/topic/class counts and index sizes
    Stats,

    /// Start a server
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(value: ProgressArg) -> Self {
        match value {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum ServeService {
    /// Start the core Query API (intent routing, retrieval, generation, verification)
    Core,

    /// Start the session-aware gateway in front of the core Query API
    Gateway,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path, progress } => {
            let mode = progress.map(ProgressMode::from).unwrap_or_else(ProgressMode::default_for_tty);
            ingest::run_ingest(&cfg, &path, mode).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve { service } => match service {
            ServeService::Core => {
                server::run_server(&cfg).await?;
            }
            ServeService::Gateway => {
                gateway::server::run_gateway(&cfg).await?;
            }
        },
    }

    Ok(())
}
