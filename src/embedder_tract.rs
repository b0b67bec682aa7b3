//! Pure-Rust local embedding pipeline (fallback for musl and Intel Mac).
//!
//! Loads an ONNX bi-encoder with tract-onnx, tokenizes with the tokenizers
//! crate, and pools to a fixed 768-dim unit vector. Model weights and
//! tokenizer files are lazily fetched from the Hugging Face Hub into a
//! local cache, mirroring the shape of the prior MiniLM-only fallback but
//! generalized to the 768-dim / 384-token-cap contract used across the
//! repo.
#![cfg(feature = "local-embeddings-tract")]

use anyhow::{bail, Result};
use std::path::PathBuf;
use tract_onnx::prelude::*;

use crate::config::EmbeddingConfig;
use crate::embedder::{normalize_l2, DIMS, MAX_TOKENS};

const DEFAULT_REPO: &str = "BAAI/bge-base-en-v1.5";

fn model_manifest(model_name: &str) -> Result<(&'static str, &'static str, &'static str, usize)> {
    match model_name {
        "bge-base-en" | "all-MiniLM-L6-v2-768" => {
            Ok((DEFAULT_REPO, "onnx/model.onnx", "tokenizer.json", DIMS))
        }
        _ => bail!("tract backend supports only bge-base-en for now. Requested: '{model_name}'"),
    }
}

fn cache_dir() -> Result<PathBuf> {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dir = PathBuf::from(base).join(".cache").join("context-harness").join("models");
    std::fs::create_dir_all(&dir).map_err(|e| anyhow::anyhow!("create cache dir: {e}"))?;
    Ok(dir)
}

fn download_to_cache(repo: &str, path: &str, cache_path: &std::path::Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!("https://huggingface.co/{repo}/resolve/main/{}", path.replace(' ', "%20"));
    let resp = reqwest::blocking::get(&url)
        .map_err(|e| anyhow::anyhow!("download {url}: {e}"))?
        .error_for_status()
        .map_err(|e| anyhow::anyhow!("download {url}: {e}"))?;
    let bytes = resp.bytes().map_err(|e| anyhow::anyhow!("read body: {e}"))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| anyhow::anyhow!("create cache parent: {e}"))?;
    }
    std::fs::write(cache_path, &bytes).map_err(|e| anyhow::anyhow!("write cache: {e}"))?;
    Ok(())
}

fn ensure_cached(model_name: &str) -> Result<(PathBuf, PathBuf)> {
    let (repo, onnx_rel, tokenizer_rel, _) = model_manifest(model_name)?;
    let dir = cache_dir()?;
    let model_dir = dir.join(model_name);
    let onnx_path = model_dir.join(onnx_rel);
    let tokenizer_path = model_dir.join(tokenizer_rel);
    download_to_cache(repo, onnx_rel, &onnx_path)?;
    download_to_cache(repo, tokenizer_rel, &tokenizer_path)?;
    Ok((onnx_path, tokenizer_path))
}

type Runnable = TypedRunnableModel<TypedModel>;

/// A loaded tokenizer + runnable ONNX model, held as a process singleton by
/// the caller (not thread-safe to call concurrently; callers serialize
/// access, matching the rest of the repo's ONNX-session discipline).
pub struct TractSession {
    tokenizer: tokenizers::Tokenizer,
    model: Runnable,
    dims: usize,
}

impl TractSession {
    pub fn load(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config.model.clone().unwrap_or_else(|| "bge-base-en".to_string());
        let (_, _, _, dims) = model_manifest(&model_name)?;
        let (onnx_path, tokenizer_path) = ensure_cached(&model_name)?;

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;

        let model = tract_onnx::onnx()
            .model_for_path(onnx_path)
            .map_err(|e| anyhow::anyhow!("load onnx: {e}"))?
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("optimize: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("build tract runnable: {e}"))?;

        Ok(TractSession { tokenizer, model, dims })
    }

    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let encodings: Vec<_> = texts
            .iter()
            .map(|s| {
                self.tokenizer
                    .encode(s.as_str(), true)
                    .map_err(|e| anyhow::anyhow!("tokenize: {e}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(1)
            .min(MAX_TOKENS);

        let batch_size = encodings.len();
        let mut input_ids = vec![0i64; batch_size * max_len];
        let mut attention_mask = vec![0i64; batch_size * max_len];

        for (i, enc) in encodings.iter().enumerate() {
            let ids = enc.get_ids();
            let len = ids.len().min(max_len);
            for (j, &id) in ids.iter().take(len).enumerate() {
                input_ids[i * max_len + j] = id as i64;
                attention_mask[i * max_len + j] = 1;
            }
        }

        let input_ids_tensor = ndarray::Array2::from_shape_vec((batch_size, max_len), input_ids)
            .map_err(|e| anyhow::anyhow!("input ids shape: {e}"))?;
        let attention_mask_tensor =
            ndarray::Array2::from_shape_vec((batch_size, max_len), attention_mask)
                .map_err(|e| anyhow::anyhow!("attention mask shape: {e}"))?;

        let input_ids_t: Tensor = input_ids_tensor.into();
        let attention_mask_t: Tensor = attention_mask_tensor.into();
        let result = self
            .model
            .run(tvec!(input_ids_t.into(), attention_mask_t.into()))
            .map_err(|e| anyhow::anyhow!("run model: {e}"))?;

        let output = result.into_iter().next().ok_or_else(|| anyhow::anyhow!("no output tensor"))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| anyhow::anyhow!("output to array: {e}"))?;

        let shape = view.shape();
        let mut out = Vec::with_capacity(batch_size);
        if shape.len() == 2 {
            for i in 0..shape[0] {
                let row: Vec<f32> = view.slice(ndarray::s![i, ..]).iter().copied().collect();
                out.push(normalize_l2(row));
            }
        } else if shape.len() == 3 {
            let seq_len = shape[1];
            for (i, enc) in encodings.iter().enumerate() {
                let valid_len = enc.get_ids().len().min(seq_len).min(max_len);
                let mut sum = vec![0f32; self.dims];
                let mut count = 0f32;
                for j in 0..valid_len {
                    for (k, &v) in view.slice(ndarray::s![i, j, ..]).iter().enumerate() {
                        if k < self.dims {
                            sum[k] += v;
                        }
                    }
                    count += 1.0;
                }
                if count > 0.0 {
                    for x in &mut sum {
                        *x /= count;
                    }
                }
                out.push(normalize_l2(sum));
            }
        } else {
            bail!("unexpected output shape: {:?}", shape);
        }

        Ok(out)
    }
}
