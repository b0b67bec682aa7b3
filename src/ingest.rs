//! JSONL ingestion entry point.
//!
//! `ctx ingest <path>` reads line-delimited `Chunk` JSON records, writes
//! them to the relational store (the source of truth), rebuilds the
//! lexical index wholesale, and embeds+upserts them into the dense index in
//! batches. Progress reporting reuses the teacher's `ProgressMode`/
//! `SyncProgressReporter` machinery, repurposed from sync-phase reporting
//! to ingest-phase reporting.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::dense_index::{DenseIndex, QdrantDenseIndex};
use crate::embedder::{create_embedder, normalize_l2};
use crate::lexical_index::{LexicalIndex, TantivyLexicalIndex};
use crate::models::{Chunk, ChunkPayload, VectorPoint};
use crate::point_id::deterministic_point_id;
use crate::progress::{ProgressMode, SyncProgressEvent};

const EMBED_BATCH_SIZE: usize = 8;

pub async fn run_ingest(config: &Config, path: &Path, progress_mode: ProgressMode) -> Result<()> {
    let reporter = progress_mode.reporter();
    let pool = db::connect(config).await?;

    reporter.report(SyncProgressEvent::Discovering {
        connector: "jsonl".to_string(),
    });

    let chunks = read_jsonl_chunks(path)?;
    let total = chunks.len() as u64;

    persist_chunks(&pool, &chunks).await?;

    let lexical = TantivyLexicalIndex::new(&config.lexical_index.path);
    lexical.rebuild(&chunks).context("rebuild lexical index")?;

    if config.embedding.is_enabled() {
        let embedder = create_embedder(&config.embedding)?;
        let dense = Arc::new(QdrantDenseIndex::new(&config.dense_index.url, &config.dense_index.collection)?);
        dense.ensure_collection(embedder.dims()).await?;

        let mut done = 0u64;
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder.embed_batch(&texts).await?;

            let points: Vec<VectorPoint> = batch
                .iter()
                .zip(vectors.into_iter())
                .map(|(chunk, vector)| VectorPoint {
                    id: deterministic_point_id(&chunk.chunk_id),
                    vector: normalize_l2(vector),
                    payload: ChunkPayload::from(chunk),
                })
                .collect();

            dense.upsert(&points).await?;
            done += batch.len() as u64;
            reporter.report(SyncProgressEvent::Ingesting {
                connector: "jsonl".to_string(),
                n: done,
                total,
            });
        }
    } else {
        reporter.report(SyncProgressEvent::Ingesting {
            connector: "jsonl".to_string(),
            n: total,
            total,
        });
    }

    pool.close().await;
    println!("Ingested {total} chunks from {}", path.display());
    Ok(())
}

fn read_jsonl_chunks(path: &Path) -> Result<Vec<Chunk>> {
    let file = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let mut chunks = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: Chunk = serde_json::from_str(&line).with_context(|| format!("parse chunk at line {}", line_no + 1))?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

async fn persist_chunks(pool: &SqlitePool, chunks: &[Chunk]) -> Result<()> {
    for chunk in chunks {
        let metadata_json = serde_json::to_string(&chunk.metadata)?;
        sqlx::query(
            "INSERT INTO chunks (chunk_id, chunk_type, title, text, metadata, created_at) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(chunk_id) DO UPDATE SET chunk_type = excluded.chunk_type, title = excluded.title, \
             text = excluded.text, metadata = excluded.metadata, created_at = excluded.created_at",
        )
        .bind(&chunk.chunk_id)
        .bind(chunk.chunk_type.as_str())
        .bind(&chunk.title)
        .bind(&chunk.text)
        .bind(&metadata_json)
        .bind(chunk.created_at)
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkType;

    #[test]
    fn reads_jsonl_chunks_skipping_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.jsonl");
        let chunk = Chunk {
            chunk_id: "A".to_string(),
            chunk_type: ChunkType::Topic,
            title: "T".to_string(),
            text: "text".to_string(),
            metadata: serde_json::json!({}),
            created_at: 0,
        };
        let line = serde_json::to_string(&chunk).unwrap();
        std::fs::write(&path, format!("{line}\n\n{line}\n")).unwrap();

        let chunks = read_jsonl_chunks(&path).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_id, "A");
    }
}
