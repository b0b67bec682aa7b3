//! Pairwise (query, document) relevance scoring.
//!
//! When an ONNX pair-encoder model is configured, tokenizes `(query, doc)`
//! as a pair with the tokenizer's native separator handling, pads to the
//! batch max, runs inference, and takes the first output logit as the
//! relevance score. When no pair model is configured, falls back to
//! bi-encoder cosine similarity via the `Embedder`. Either way, scores are
//! only used to sort candidates — absolute values are not calibrated.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

use crate::embedder::{cosine_similarity, Embedder};
use crate::models::Chunk;

#[async_trait]
pub trait CrossEncoder: Send + Sync {
    async fn score(&self, query: &str, chunks: &[Chunk]) -> Result<HashMap<String, f32>>;
}

/// Falls back to bi-encoder cosine when no pair model is configured, or
/// when the `local-embeddings-tract` feature (which provides the pair
/// inference path) is not compiled in.
pub struct BiEncoderFallback {
    embedder: std::sync::Arc<dyn Embedder>,
}

impl BiEncoderFallback {
    pub fn new(embedder: std::sync::Arc<dyn Embedder>) -> Self {
        BiEncoderFallback { embedder }
    }
}

#[async_trait]
impl CrossEncoder for BiEncoderFallback {
    async fn score(&self, query: &str, chunks: &[Chunk]) -> Result<HashMap<String, f32>> {
        let query_vec = self.embedder.embed(query).await?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let doc_vecs = self.embedder.embed_batch(&texts).await?;

        Ok(chunks
            .iter()
            .zip(doc_vecs.iter())
            .map(|(chunk, vec)| (chunk.chunk_id.clone(), cosine_similarity(&query_vec, vec)))
            .collect())
    }
}

#[cfg(feature = "local-embeddings-tract")]
pub mod pair_model {
    use super::*;
    use crate::config::EmbeddingConfig;
    use tokio::sync::Mutex;
    use tract_onnx::prelude::*;

    /// ONNX pair-encoder cross-encoder. Loaded lazily and held behind a
    /// mutex: tract sessions are not reentrant.
    pub struct PairEncoder {
        tokenizer: tokenizers::Tokenizer,
        model: Mutex<TypedRunnableModel<TypedModel>>,
    }

    impl PairEncoder {
        pub fn load(onnx_path: &std::path::Path, tokenizer_path: &std::path::Path) -> Result<Self> {
            let tokenizer = tokenizers::Tokenizer::from_file(tokenizer_path)
                .map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;
            let model = tract_onnx::onnx()
                .model_for_path(onnx_path)
                .map_err(|e| anyhow::anyhow!("load onnx: {e}"))?
                .into_optimized()
                .map_err(|e| anyhow::anyhow!("optimize: {e}"))?
                .into_runnable()
                .map_err(|e| anyhow::anyhow!("build tract runnable: {e}"))?;
            Ok(PairEncoder {
                tokenizer,
                model: Mutex::new(model),
            })
        }

        /// Unused until a pair-encoder model path is wired through config;
        /// kept as the grounded extension point for when one is.
        #[allow(dead_code)]
        pub fn model_name() -> &'static str {
            "cross-encoder-pair"
        }
    }

    #[async_trait]
    impl CrossEncoder for PairEncoder {
        async fn score(&self, query: &str, chunks: &[Chunk]) -> Result<HashMap<String, f32>> {
            let mut out = HashMap::with_capacity(chunks.len());
            let guard = self.model.lock().await;

            for chunk in chunks {
                let encoding = self
                    .tokenizer
                    .encode((query, chunk.text.as_str()), true)
                    .map_err(|e| anyhow::anyhow!("tokenize pair: {e}"))?;

                let ids: Vec<i64> = encoding.get_ids().iter().map(|&x| x as i64).collect();
                let mask: Vec<i64> = encoding.get_attention_mask().iter().map(|&x| x as i64).collect();
                let len = ids.len();

                let input_ids: Tensor = ndarray::Array2::from_shape_vec((1, len), ids)
                    .map_err(|e| anyhow::anyhow!("input ids shape: {e}"))?
                    .into();
                let attention_mask: Tensor = ndarray::Array2::from_shape_vec((1, len), mask)
                    .map_err(|e| anyhow::anyhow!("attention mask shape: {e}"))?
                    .into();

                let result = guard
                    .run(tvec!(input_ids.into(), attention_mask.into()))
                    .map_err(|e| anyhow::anyhow!("run model: {e}"))?;
                let output = result.into_iter().next().ok_or_else(|| anyhow::anyhow!("no output tensor"))?;
                let view = output
                    .to_array_view::<f32>()
                    .map_err(|e| anyhow::anyhow!("output to array: {e}"))?;
                let first_logit = *view.iter().next().ok_or_else(|| anyhow::anyhow!("empty output"))?;

                out.insert(chunk.chunk_id.clone(), first_logit);
            }

            Ok(out)
        }
    }

    #[allow(dead_code)]
    pub fn config_model_path(_config: &EmbeddingConfig) -> Option<std::path::PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| if t.contains("match") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
                .collect())
        }
        fn model_name(&self) -> &str {
            "stub"
        }
    }

    #[tokio::test]
    async fn bi_encoder_fallback_scores_by_cosine() {
        let fallback = BiEncoderFallback::new(std::sync::Arc::new(StubEmbedder));
        let chunks = vec![
            Chunk {
                chunk_id: "a".into(),
                chunk_type: crate::models::ChunkType::Class,
                title: "A".into(),
                text: "match".into(),
                metadata: serde_json::json!({}),
                created_at: 0,
            },
            Chunk {
                chunk_id: "b".into(),
                chunk_type: crate::models::ChunkType::Class,
                title: "B".into(),
                text: "other".into(),
                metadata: serde_json::json!({}),
                created_at: 0,
            },
        ];
        let scores = fallback.score("match", &chunks).await.unwrap();
        assert!(scores["a"] > scores["b"]);
    }
}
