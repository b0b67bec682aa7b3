//! Vector store client: cosine top-K search with HNSW tuning, point fetch
//! by payload identifier, and idempotent upsert.

use anyhow::{Context, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, Distance, Filter, PointStruct, ScrollPointsBuilder,
    SearchParamsBuilder, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder, WithPayloadSelector,
    WithVectorsSelector,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;

use crate::models::{Candidate, ChunkPayload, ChunkType, VectorPoint};

#[async_trait]
pub trait DenseIndex: Send + Sync {
    /// Top-K by cosine descending, with payload and vector populated.
    /// Scores are comparable within one call, not across calls.
    async fn search(&self, vector: &[f32], top_k: usize, ef: usize) -> Result<Vec<Candidate>>;

    /// Hydrates payload and vector for chunk ids not returned by `search`,
    /// via a filter predicate on the payload field `chunk_id`. The slow path.
    async fn get_points_by_chunk_ids(&self, ids: &[String]) -> Result<HashMap<String, Candidate>>;

    /// Direct point fetch by deterministic point id. The fast path used by
    /// the session gateway's payload cache.
    async fn get_payloads_by_point_ids(&self, ids: &[uuid::Uuid]) -> Result<HashMap<uuid::Uuid, ChunkPayload>>;

    /// Idempotent upsert keyed by the deterministic point id.
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()>;

    /// Ensures the collection exists with the configured dimension.
    async fn ensure_collection(&self, dims: usize) -> Result<()>;

    /// Approximate point count, for `ctx stats`.
    async fn count(&self) -> Result<u64>;
}

pub struct QdrantDenseIndex {
    client: Qdrant,
    collection: String,
}

impl QdrantDenseIndex {
    pub fn new(url: &str, collection: impl Into<String>) -> Result<Self> {
        let client = Qdrant::from_url(url).build().context("build qdrant client")?;
        Ok(QdrantDenseIndex {
            client,
            collection: collection.into(),
        })
    }

    fn payload_to_chunk_payload(payload: &HashMap<String, qdrant_client::qdrant::Value>) -> Option<ChunkPayload> {
        let chunk_id = payload.get("chunk_id")?.as_str()?.to_string();
        let title = payload.get("title").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let chunk_type_str = payload.get("chunk_type").and_then(|v| v.as_str()).unwrap_or("class");
        let chunk_type = parse_chunk_type(chunk_type_str);
        let metadata = payload
            .get("metadata")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::json!({}));
        Some(ChunkPayload {
            chunk_id,
            title,
            chunk_type,
            metadata,
        })
    }
}

fn parse_chunk_type(s: &str) -> ChunkType {
    match s {
        "course" => ChunkType::Course,
        "topic" => ChunkType::Topic,
        "topic-summary" => ChunkType::TopicSummary,
        "class" => ChunkType::Class,
        "assignment" => ChunkType::Assignment,
        "sql-result" => ChunkType::SqlResult,
        _ => ChunkType::Class,
    }
}

#[async_trait]
impl DenseIndex for QdrantDenseIndex {
    async fn search(&self, vector: &[f32], top_k: usize, ef: usize) -> Result<Vec<Candidate>> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, vector.to_vec(), top_k as u64)
                    .with_payload(WithPayloadSelector::from(true))
                    .with_vectors(WithVectorsSelector::from(true))
                    .params(SearchParamsBuilder::default().hnsw_ef(ef as u64)),
            )
            .await
            .context("dense search")?;

        let mut out = Vec::with_capacity(response.result.len());
        for point in response.result {
            let chunk_id = point
                .payload
                .get("chunk_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_default();
            let vector = point.vectors.and_then(|v| v.vectors_options).and_then(|vo| match vo {
                qdrant_client::qdrant::vectors::VectorsOptions::Vector(v) => Some(v.data),
                _ => None,
            });
            out.push(Candidate {
                chunk_id,
                score: point.score,
                vector,
                payload: Self::payload_to_chunk_payload(&point.payload),
            });
        }
        Ok(out)
    }

    async fn get_points_by_chunk_ids(&self, ids: &[String]) -> Result<HashMap<String, Candidate>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let filter = Filter::must(ids.iter().map(|id| Condition::matches("chunk_id", id.clone())).collect::<Vec<_>>());

        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection)
                    .filter(filter)
                    .limit(ids.len() as u32)
                    .with_payload(WithPayloadSelector::from(true))
                    .with_vectors(WithVectorsSelector::from(true)),
            )
            .await
            .context("scroll by chunk_id")?;

        let mut out = HashMap::new();
        for point in response.result {
            let chunk_id = point
                .payload
                .get("chunk_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_default();
            if chunk_id.is_empty() {
                continue;
            }
            let vector = point.vectors.and_then(|v| v.vectors_options).and_then(|vo| match vo {
                qdrant_client::qdrant::vectors::VectorsOptions::Vector(v) => Some(v.data),
                _ => None,
            });
            out.insert(
                chunk_id.clone(),
                Candidate {
                    chunk_id,
                    score: 0.0,
                    vector,
                    payload: Self::payload_to_chunk_payload(&point.payload),
                },
            );
        }
        Ok(out)
    }

    async fn get_payloads_by_point_ids(&self, ids: &[uuid::Uuid]) -> Result<HashMap<uuid::Uuid, ChunkPayload>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let point_ids: Vec<qdrant_client::qdrant::PointId> = ids.iter().map(|id| id.to_string().into()).collect();

        let response = self
            .client
            .get_points(
                qdrant_client::qdrant::GetPointsBuilder::new(&self.collection, point_ids)
                    .with_payload(WithPayloadSelector::from(true)),
            )
            .await
            .context("get points by id")?;

        let mut out = HashMap::new();
        for point in response.result {
            let Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(uuid_str)) = point.id.and_then(|i| i.point_id_options) else {
                continue;
            };
            let Ok(id) = uuid::Uuid::parse_str(&uuid_str) else { continue };
            if let Some(payload) = Self::payload_to_chunk_payload(&point.payload) {
                out.insert(id, payload);
            }
        }
        Ok(out)
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let qdrant_points: Vec<PointStruct> = points
            .iter()
            .map(|p| {
                let mut payload: HashMap<String, qdrant_client::qdrant::Value> = HashMap::new();
                payload.insert("chunk_id".to_string(), p.payload.chunk_id.clone().into());
                payload.insert("title".to_string(), p.payload.title.clone().into());
                payload.insert("chunk_type".to_string(), p.payload.chunk_type.as_str().into());
                payload.insert(
                    "metadata".to_string(),
                    serde_json::to_string(&p.payload.metadata).unwrap_or_default().into(),
                );
                PointStruct::new(p.id.to_string(), p.vector.clone(), payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, qdrant_points))
            .await
            .context("upsert points")?;
        Ok(())
    }

    async fn ensure_collection(&self, dims: usize) -> Result<()> {
        let exists = self.client.collection_exists(&self.collection).await.context("check collection exists")?;
        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection)
                        .vectors_config(VectorParamsBuilder::new(dims as u64, Distance::Cosine)),
                )
                .await
                .context("create collection")?;
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let info = self.client.collection_info(&self.collection).await.context("collection info")?;
        Ok(info.result.and_then(|r| r.points_count).unwrap_or(0))
    }
}
