//! Text embedding: fixed-dimension, L2-normalized vectors.
//!
//! `D = 768` is a global constant shared by the dense index, MMR, and the
//! bi-encoder cross-encoder fallback. Two backends are available behind
//! Cargo features, matching the layout this crate has always used for local
//! inference: `fastembed` (bundled ORT, the primary path) and `tract-onnx`
//! + `tokenizers` (pure Rust, the fallback path for platforms without a
//! prebuilt ORT binary).

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;

/// Global embedding dimension. Fixed at boot; every vector produced by an
/// `Embedder` implementation must have exactly this length.
pub const DIMS: usize = 768;

/// Runtime cap on subword tokens per input, even though the underlying
/// model is capable of longer sequences (512). Keeps inference latency and
/// memory bounded.
pub const MAX_TOKENS: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_batch(std::slice::from_ref(&text.to_string())).await?.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dims(&self) -> usize {
        DIMS
    }

    fn model_name(&self) -> &str;
}

/// Embedding provider disabled by configuration. Used when the caller only
/// needs lexical/relational retrieval.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embedding is disabled; set [embedding] provider in config")
    }

    fn model_name(&self) -> &str {
        "disabled"
    }
}

/// Build the configured embedder. Dispatches on `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "local" => Ok(Box::new(local::LocalEmbedder::new(config.clone()))),
        other => bail!("unknown embedding provider: {other}"),
    }
}

/// L2-normalize a vector in place-equivalent fashion; safe on the zero
/// vector (left unchanged).
pub fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Cosine similarity between two vectors; zero for empty or mismatched
/// lengths (mirrors the zero-similarity convention used by MMR for
/// missing vectors).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a <= 1e-9 || norm_b <= 1e-9 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Little-endian f32 BLOB encode/decode, kept for compatibility with tools
/// that want a raw vector dump (e.g. `ctx stats` and cache warm exports).
pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

mod local {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Local on-box embedder. Loads its backend lazily on first use and
    /// keeps it as a process-wide singleton behind a mutex: ONNX sessions
    /// are not guaranteed reentrant.
    pub struct LocalEmbedder {
        config: EmbeddingConfig,
        inner: Arc<Mutex<Option<Backend>>>,
    }

    enum Backend {
        #[cfg(feature = "local-embeddings-fastembed")]
        FastEmbed(fastembed::TextEmbedding),
        #[cfg(feature = "local-embeddings-tract")]
        Tract(crate::embedder_tract::TractSession),
    }

    impl LocalEmbedder {
        pub fn new(config: EmbeddingConfig) -> Self {
            LocalEmbedder {
                config,
                inner: Arc::new(Mutex::new(None)),
            }
        }

        async fn ensure_loaded(&self) -> Result<()> {
            let mut guard = self.inner.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            let config = self.config.clone();
            let backend = tokio::task::spawn_blocking(move || load_backend(&config)).await??;
            *guard = Some(backend);
            Ok(())
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.ensure_loaded().await?;
            let guard = self.inner.lock().await;
            let backend = guard.as_ref().expect("loaded above");
            match backend {
                #[cfg(feature = "local-embeddings-fastembed")]
                Backend::FastEmbed(model) => {
                    let owned: Vec<String> = texts.to_vec();
                    let embeddings = model
                        .embed(owned, None)
                        .map_err(|e| anyhow::anyhow!("fastembed inference: {e}"))?;
                    Ok(embeddings.into_iter().map(normalize_l2).collect())
                }
                #[cfg(feature = "local-embeddings-tract")]
                Backend::Tract(session) => session.embed_batch(texts),
                #[allow(unreachable_patterns)]
                _ => bail!("no local embedding backend compiled in"),
            }
        }

        fn model_name(&self) -> &str {
            self.config.model.as_deref().unwrap_or("local-default")
        }
    }

    fn load_backend(config: &EmbeddingConfig) -> Result<Backend> {
        #[cfg(feature = "local-embeddings-fastembed")]
        {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "all-MiniLM-L6-v2-768".to_string());
            let init = fastembed::InitOptions::new(resolve_fastembed_model(&model_name)?);
            let model = fastembed::TextEmbedding::try_new(init)
                .map_err(|e| anyhow::anyhow!("load fastembed model {model_name}: {e}"))?;
            return Ok(Backend::FastEmbed(model));
        }
        #[cfg(all(not(feature = "local-embeddings-fastembed"), feature = "local-embeddings-tract"))]
        {
            return Ok(Backend::Tract(crate::embedder_tract::TractSession::load(config)?));
        }
        #[allow(unreachable_code)]
        {
            bail!("no local embedding backend compiled in; enable local-embeddings-fastembed or local-embeddings-tract")
        }
    }

    #[cfg(feature = "local-embeddings-fastembed")]
    fn resolve_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
        match name {
            "all-MiniLM-L6-v2-768" | "bge-base-en" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            other => bail!("unsupported fastembed model: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_zero_for_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn cosine_zero_for_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
    }

    #[test]
    fn cosine_one_for_identical_unit_vectors() {
        let v = vec![0.6, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_l2_produces_unit_length() {
        let v = normalize_l2(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn normalize_l2_leaves_zero_vector_unchanged() {
        let v = normalize_l2(vec![0.0, 0.0, 0.0]);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 0.0, 3.125];
        let blob = vec_to_blob(&v);
        assert_eq!(blob_to_vec(&blob), v);
    }
}
