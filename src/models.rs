//! Core data models used throughout Context Harness.
//!
//! These types represent the evidence (`Chunk`), in-flight retrieval state
//! (`Candidate`, `VectorPoint`), and the final response (`QueryResult`) that
//! flow through the retrieval-and-routing pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of retrievable chunk kinds. `SqlResult` is reserved for the
/// synthetic chunks produced by the relational fact path (`chunk_id`
/// prefixed `SQL-`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkType {
    Course,
    Topic,
    TopicSummary,
    Class,
    Assignment,
    SqlResult,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Course => "course",
            ChunkType::Topic => "topic",
            ChunkType::TopicSummary => "topic-summary",
            ChunkType::Class => "class",
            ChunkType::Assignment => "assignment",
            ChunkType::SqlResult => "sql-result",
        }
    }
}

/// Unit of retrievable evidence. `chunk_id` is stable and opaque; it is the
/// identifier used by retrieval, citations, and deterministic point ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub chunk_type: ChunkType,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

impl Chunk {
    pub fn is_synthetic_sql_result(&self) -> bool {
        self.chunk_type == ChunkType::SqlResult && self.chunk_id.starts_with("SQL-")
    }
}

/// Mirror of the persisted chunk fields carried by a vector store payload
/// and used for routing decisions without a full relational fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub chunk_id: String,
    pub title: String,
    pub chunk_type: ChunkType,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl From<&Chunk> for ChunkPayload {
    fn from(chunk: &Chunk) -> Self {
        ChunkPayload {
            chunk_id: chunk.chunk_id.clone(),
            title: chunk.title.clone(),
            chunk_type: chunk.chunk_type,
            metadata: chunk.metadata.clone(),
        }
    }
}

/// In-flight retrieval record. `vector` may be absent until hydrated by a
/// point fetch; after merge+hydrate every Candidate entering MMR carries a
/// vector of the global embedding dimension unless deliberately excluded.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub score: f32,
    pub vector: Option<Vec<f32>>,
    pub payload: Option<ChunkPayload>,
}

impl Candidate {
    pub fn new(chunk_id: impl Into<String>, score: f32) -> Self {
        Candidate {
            chunk_id: chunk_id.into(),
            score,
            vector: None,
            payload: None,
        }
    }
}

/// A persisted vector-store tuple: deterministic UUID id, unit-norm vector,
/// and a payload mirror of the chunk essentials.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

/// Intent label produced by the classifier and carried through routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Intent {
    Greeting,
    Factual,
    Semantic,
    Mixed,
}

/// Confidence band attached to a `QueryResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// One entry of the diagnostic retrieval chain: a ranked candidate summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalStep {
    pub id: String,
    pub score: f32,
}

/// Final response of a query through the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub answer: String,
    pub sources: Vec<String>,
    pub intent: Intent,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_chain: Option<Vec<RetrievalStep>>,
}

/// One turn of prior conversation, as carried in the Query API's `history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}
