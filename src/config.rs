//! Configuration parsing and validation.
//!
//! The engine is configured via a TOML file (default: `config/ctx.toml`).
//! Every variable named in the external-interfaces contract is a field
//! here, with the same `#[serde(default = "fn_name")]` + explicit
//! `bail!`-per-invariant validation style this crate has always used.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generative: GenerativeConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub lexical_index: LexicalIndexConfig,
    #[serde(default)]
    pub dense_index: DenseIndexConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            batch_size: default_embedding_batch_size(),
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_batch_size() -> usize {
    8
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// The pipeline-tuning surface named in the external interfaces.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_topk_dense")]
    pub topk_dense: usize,
    #[serde(default = "default_topk_lex")]
    pub topk_lex: usize,
    #[serde(default = "default_mmr_final_size")]
    pub mmr_final_size: usize,
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
    #[serde(default = "default_rerank_final_n")]
    pub rerank_final_n: usize,
    #[serde(default = "default_context_k")]
    pub context_k: usize,
    #[serde(default = "default_qdrant_ef")]
    pub qdrant_ef: usize,
    #[serde(default = "default_prompt_max_tokens")]
    pub prompt_max_tokens: usize,
    #[serde(default = "default_prompt_reserved_answer")]
    pub prompt_reserved_answer: usize,
    #[serde(default = "default_prompt_overhead")]
    pub prompt_overhead: usize,
    #[serde(default = "default_rag_score_fallback_threshold")]
    pub rag_score_fallback_threshold: f32,
    #[serde(default = "default_embed_cache_size")]
    pub embed_cache_size: usize,
    #[serde(default = "default_retr_cache_size")]
    pub retr_cache_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            topk_dense: default_topk_dense(),
            topk_lex: default_topk_lex(),
            mmr_final_size: default_mmr_final_size(),
            mmr_lambda: default_mmr_lambda(),
            rerank_top_n: default_rerank_top_n(),
            rerank_final_n: default_rerank_final_n(),
            context_k: default_context_k(),
            qdrant_ef: default_qdrant_ef(),
            prompt_max_tokens: default_prompt_max_tokens(),
            prompt_reserved_answer: default_prompt_reserved_answer(),
            prompt_overhead: default_prompt_overhead(),
            rag_score_fallback_threshold: default_rag_score_fallback_threshold(),
            embed_cache_size: default_embed_cache_size(),
            retr_cache_size: default_retr_cache_size(),
        }
    }
}

fn default_topk_dense() -> usize {
    100
}
fn default_topk_lex() -> usize {
    50
}
fn default_mmr_final_size() -> usize {
    20
}
fn default_mmr_lambda() -> f32 {
    0.7
}
fn default_rerank_top_n() -> usize {
    20
}
fn default_rerank_final_n() -> usize {
    6
}
fn default_context_k() -> usize {
    4
}
fn default_qdrant_ef() -> usize {
    200
}
fn default_prompt_max_tokens() -> usize {
    4096
}
fn default_prompt_reserved_answer() -> usize {
    512
}
fn default_prompt_overhead() -> usize {
    128
}
fn default_rag_score_fallback_threshold() -> f32 {
    0.3
}
fn default_embed_cache_size() -> usize {
    1000
}
fn default_retr_cache_size() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerativeConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            url: default_llm_url(),
            model: default_llm_model(),
            temperature: default_llm_temperature(),
            max_tokens: default_llm_max_tokens(),
            api_key: None,
        }
    }
}

fn default_llm_provider() -> String {
    "local-completion".to_string()
}
fn default_llm_url() -> String {
    "http://localhost:8080/completion".to_string()
}
fn default_llm_model() -> String {
    "local".to_string()
}
fn default_llm_temperature() -> f32 {
    0.2
}
fn default_llm_max_tokens() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_session_ttl_sec")]
    pub session_ttl_sec: u64,
    #[serde(default = "default_payload_cache_max")]
    pub payload_cache_max: usize,
    #[serde(default = "default_payload_cache_ttl_sec")]
    pub payload_cache_ttl_sec: u64,
    #[serde(default)]
    pub shared_kv_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
            backend_url: default_backend_url(),
            session_ttl_sec: default_session_ttl_sec(),
            payload_cache_max: default_payload_cache_max(),
            payload_cache_ttl_sec: default_payload_cache_ttl_sec(),
            shared_kv_url: None,
        }
    }
}

fn default_gateway_bind() -> String {
    "127.0.0.1:8090".to_string()
}
fn default_backend_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_session_ttl_sec() -> u64 {
    900
}
fn default_payload_cache_max() -> usize {
    1000
}
fn default_payload_cache_ttl_sec() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct LexicalIndexConfig {
    #[serde(default = "default_lexical_index_path")]
    pub path: PathBuf,
}

impl Default for LexicalIndexConfig {
    fn default() -> Self {
        Self {
            path: default_lexical_index_path(),
        }
    }
}

fn default_lexical_index_path() -> PathBuf {
    PathBuf::from("data/lexical-index")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DenseIndexConfig {
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default = "default_collection_name")]
    pub collection: String,
}

impl Default for DenseIndexConfig {
    fn default() -> Self {
        Self {
            url: default_qdrant_url(),
            collection: default_collection_name(),
        }
    }
}

fn default_qdrant_url() -> String {
    "http://127.0.0.1:6334".to_string()
}
fn default_collection_name() -> String {
    "chunks".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.retrieval.mmr_final_size == 0 {
        anyhow::bail!("retrieval.mmr_final_size must be > 0");
    }
    if !(0.0..=1.0).contains(&config.retrieval.mmr_lambda) {
        anyhow::bail!("retrieval.mmr_lambda must be in [0.0, 1.0]");
    }
    if config.retrieval.context_k == 0 {
        anyhow::bail!("retrieval.context_k must be > 0");
    }
    if config.retrieval.rerank_final_n == 0 {
        anyhow::bail!("retrieval.rerank_final_n must be > 0");
    }
    if config.retrieval.prompt_reserved_answer + config.retrieval.prompt_overhead >= config.retrieval.prompt_max_tokens {
        anyhow::bail!("retrieval.prompt_max_tokens must exceed prompt_reserved_answer + prompt_overhead");
    }
    if !(0.0..=1.0).contains(&config.retrieval.rag_score_fallback_threshold) {
        anyhow::bail!("retrieval.rag_score_fallback_threshold must be in [0.0, 1.0]");
    }

    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!("embedding.model must be specified when provider is '{}'", config.embedding.provider);
    }
    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        other => anyhow::bail!("Unknown embedding provider: '{other}'. Must be disabled or local."),
    }

    match config.generative.provider.as_str() {
        "local-completion" | "chat" | "generic" => {}
        other => anyhow::bail!("Unknown generative provider: '{other}'. Must be local-completion, chat, or generic."),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.toml");
        std::fs::write(
            &path,
            r#"
            [db]
            path = "data/ctx.sqlite"

            [server]
            bind = "127.0.0.1:8080"
            "#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.retrieval.context_k, 4);
        assert_eq!(config.retrieval.rerank_final_n, 6);
        assert_eq!(config.retrieval.mmr_lambda, 0.7);
    }

    #[test]
    fn rejects_bad_mmr_lambda() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.toml");
        std::fs::write(
            &path,
            r#"
            [db]
            path = "data/ctx.sqlite"
            [server]
            bind = "127.0.0.1:8080"
            [retrieval]
            mmr_lambda = 1.5
            "#,
        )
        .unwrap();

        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_unknown_embedding_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.toml");
        std::fs::write(
            &path,
            r#"
            [db]
            path = "data/ctx.sqlite"
            [server]
            bind = "127.0.0.1:8080"
            [embedding]
            provider = "openai"
            "#,
        )
        .unwrap();

        assert!(load_config(&path).is_err());
    }
}
