//! Sparse lexical search: BM25 over an inverted index of `{title, text}`.
//!
//! Standalone from the relational store — a separate on-disk index
//! directory, rebuilt wholesale from the authoritative chunk rows. If the
//! index directory is empty or unopenable, `search` degrades to an empty
//! result rather than an error: the orchestrator treats that as a
//! degraded-but-valid state, not a failure.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Schema, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy};

use crate::models::Chunk;

pub trait LexicalIndex: Send + Sync {
    /// Atomically replaces the index contents with `chunks`.
    fn rebuild(&self, chunks: &[Chunk]) -> Result<()>;

    /// BM25-ranked chunk ids for `query_text`. Never errors: an empty or
    /// unopenable index yields an empty sequence.
    fn search(&self, query_text: &str, top_k: usize) -> Vec<String>;

    /// Indexed document count, for `ctx stats`. Zero if unopenable.
    fn num_docs(&self) -> u64;
}

fn build_schema() -> (Schema, tantivy::schema::Field, tantivy::schema::Field, tantivy::schema::Field) {
    let mut builder = Schema::builder();
    let chunk_id = builder.add_text_field("chunk_id", STRING | STORED);
    let title = builder.add_text_field("title", TEXT);
    let text = builder.add_text_field("text", TEXT);
    (builder.build(), chunk_id, title, text)
}

pub struct TantivyLexicalIndex {
    path: PathBuf,
    state: RwLock<Option<OpenIndex>>,
}

struct OpenIndex {
    index: Index,
    reader: IndexReader,
    chunk_id_field: tantivy::schema::Field,
    title_field: tantivy::schema::Field,
    text_field: tantivy::schema::Field,
}

impl TantivyLexicalIndex {
    pub fn new(path: impl AsRef<Path>) -> Self {
        TantivyLexicalIndex {
            path: path.as_ref().to_path_buf(),
            state: RwLock::new(None),
        }
    }

    fn open_or_none(&self) -> Option<()> {
        if self.state.read().ok()?.is_some() {
            return Some(());
        }
        let (schema, chunk_id_field, title_field, text_field) = build_schema();
        let index = if self.path.exists() {
            Index::open_in_dir(&self.path).ok()?
        } else {
            std::fs::create_dir_all(&self.path).ok()?;
            Index::create_in_dir(&self.path, schema).ok()?
        };
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .ok()?;
        *self.state.write().ok()? = Some(OpenIndex {
            index,
            reader,
            chunk_id_field,
            title_field,
            text_field,
        });
        Some(())
    }
}

impl LexicalIndex for TantivyLexicalIndex {
    fn rebuild(&self, chunks: &[Chunk]) -> Result<()> {
        std::fs::create_dir_all(&self.path)?;
        let (schema, chunk_id_field, title_field, text_field) = build_schema();

        // Atomic replace: build fresh, then swap the cached handle.
        let index = if self.path.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) {
            Index::open_in_dir(&self.path).unwrap_or(Index::create_in_dir(&self.path, schema.clone())?)
        } else {
            Index::create_in_dir(&self.path, schema.clone())?
        };

        let mut writer: IndexWriter = index.writer(50_000_000)?;
        writer.delete_all_documents()?;
        for chunk in chunks {
            writer.add_document(doc!(
                chunk_id_field => chunk.chunk_id.clone(),
                title_field => chunk.title.clone(),
                text_field => chunk.text.clone(),
            ))?;
        }
        writer.commit()?;

        let reader = index.reader_builder().reload_policy(ReloadPolicy::OnCommitWithDelay).try_into()?;
        *self.state.write().map_err(|_| anyhow::anyhow!("lexical index lock poisoned"))? = Some(OpenIndex {
            index,
            reader,
            chunk_id_field,
            title_field,
            text_field,
        });
        Ok(())
    }

    fn search(&self, query_text: &str, top_k: usize) -> Vec<String> {
        if self.open_or_none().is_none() {
            return Vec::new();
        }
        let guard = match self.state.read() {
            Ok(g) => g,
            Err(_) => return Vec::new(),
        };
        let Some(opened) = guard.as_ref() else { return Vec::new() };

        let searcher = opened.reader.searcher();
        let parser = QueryParser::for_index(&opened.index, vec![opened.title_field, opened.text_field]);
        // Lenient parsing: no operator surface is exposed to end users, and a
        // malformed query must never turn into a hard error.
        let (query, _errors) = parser.parse_query_lenient(query_text);

        let top_docs = match searcher.search(&query, &TopDocs::with_limit(top_k)) {
            Ok(docs) => docs,
            Err(_) => return Vec::new(),
        };

        top_docs
            .into_iter()
            .filter_map(|(_score, addr)| {
                let retrieved: tantivy::TantivyDocument = searcher.doc(addr).ok()?;
                retrieved
                    .get_first(opened.chunk_id_field)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
            .collect()
    }

    fn num_docs(&self) -> u64 {
        if self.open_or_none().is_none() {
            return 0;
        }
        let Ok(guard) = self.state.read() else { return 0 };
        let Some(opened) = guard.as_ref() else { return 0 };
        opened.reader.searcher().num_docs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkType;

    fn chunk(id: &str, title: &str, text: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            chunk_type: ChunkType::Class,
            title: title.to_string(),
            text: text.to_string(),
            metadata: serde_json::json!({}),
            created_at: 0,
        }
    }

    #[test]
    fn search_on_unrebuilt_index_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyLexicalIndex::new(dir.path().join("does-not-exist-yet"));
        assert!(index.search("anything", 10).is_empty());
    }

    #[test]
    fn rebuild_then_search_finds_matching_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyLexicalIndex::new(dir.path());
        index
            .rebuild(&[
                chunk("a", "Databases and SQL", "relational model and normal forms"),
                chunk("b", "Graph Theory", "trees and spanning forests"),
            ])
            .unwrap();

        let hits = index.search("normal forms", 10);
        assert_eq!(hits.first().map(String::as_str), Some("a"));
    }
}
