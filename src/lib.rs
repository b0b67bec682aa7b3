//! # Context Harness
//!
//! **A hybrid retrieval-and-routing engine for curriculum question
//! answering.** A query is classified by intent, answered directly from
//! structured curriculum facts when a deterministic fact answers it,
//! otherwise routed through dense + lexical retrieval, MMR diversification,
//! cross-encoder reranking, budgeted prompt assembly, and a pluggable
//! generative provider — with the final answer checked against its cited
//! evidence before it's returned.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────────┐   ┌──────────────┐
//! │  Intent  │──▶│ RetrievalOrchestrator│──▶│  Generative  │
//! │Classifier│   │  dense+lexical+MMR  │   │  Provider    │
//! └──────────┘   │  +cross-encoder     │   └──────┬───────┘
//!                └──────────┬───────────┘          │
//!                           ▼                      ▼
//!                  RelationalStore (facts)    Verifier (faithfulness)
//! ```
//!
//! A second process, the [`gateway`], sits in front of the core Query API
//! and turns a single-shot `/ask` into a conversation: it tracks an
//! `active_entity`/`active_course` per session and rewrites ambiguous
//! follow-ups ("when is it offered?") before forwarding.
//!
//! ## Quick Start
//!
//! ```bash
//! ctx init                       # create database schema
//! ctx ingest data/chunks.jsonl   # load chunks into relational+lexical+dense stores
//! ctx stats                      # report index health
//! ctx serve core                 # start the Query API
//! ctx serve gateway              # start the session-aware gateway in front of it
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: `Chunk`, `Candidate`, `QueryResult`, `Intent` |
//! | [`point_id`] | Deterministic UUID derivation for vector store point ids |
//! | [`embedder`] | Embedding provider trait and local backends (fastembed / tract-onnx) |
//! | [`dense_index`] | Qdrant-backed vector search, fetch, and upsert |
//! | [`lexical_index`] | Tantivy-backed BM25 keyword search |
//! | [`relational_store`] | SQLite source of truth for chunk text and curriculum facts |
//! | [`cross_encoder`] | Reranking: bi-encoder cosine fallback, optional local pair model |
//! | [`mmr`] | Maximal marginal relevance diversification |
//! | [`prompt`] | Token-budgeted prompt assembly |
//! | [`generative`] | Generative provider trait and HTTP implementations |
//! | [`intent`] | Pattern-based intent classifier |
//! | [`orchestrator`] | Ties retrieval, routing, and generation together |
//! | [`verifier`] | Post-hoc citation/number/date/calc faithfulness checks |
//! | [`gateway`] | Session-aware conversational layer in front of the Query API |
//! | [`ingest`] | JSONL ingestion: relational + lexical + dense |
//! | [`stats`] | Index health reporting |
//! | [`server`] | Core Query API HTTP server (Axum) |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`progress`] | Ingest progress reporting (human / JSON / off) |
//!
//! ## Configuration
//!
//! Context Harness is configured via a TOML file (default: `config/ctx.toml`).
//! See [`config`] for all available options and [`config::load_config`] for
//! validation rules.

pub mod config;
pub mod cross_encoder;
pub mod db;
pub mod dense_index;
pub mod embedder;
#[cfg(feature = "local-embeddings-tract")]
pub mod embedder_tract;
pub mod gateway;
pub mod generative;
pub mod ingest;
pub mod intent;
pub mod lexical_index;
pub mod migrate;
pub mod mmr;
pub mod models;
pub mod orchestrator;
pub mod point_id;
pub mod progress;
pub mod prompt;
pub mod relational_store;
pub mod server;
pub mod stats;
pub mod verifier;
