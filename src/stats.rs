//! Index health overview.
//!
//! Reports chunk counts from the relational store, the dense index's
//! point count, and the lexical index's document count, so operators can
//! see at a glance whether an ingest landed in all three places. Used by
//! `ctx stats`.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::dense_index::{DenseIndex, QdrantDenseIndex};
use crate::lexical_index::{LexicalIndex, TantivyLexicalIndex};

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks").fetch_one(&pool).await?;
    let total_courses: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM courses").fetch_one(&pool).await?;
    let total_topics: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM topics").fetch_one(&pool).await?;
    let total_classes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM classes").fetch_one(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path).map(|m| m.len()).unwrap_or(0);

    println!("Context Engine — Index Stats");
    println!("=============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Chunks:      {total_chunks}");
    println!("  Courses:     {total_courses}");
    println!("  Topics:      {total_topics}");
    println!("  Classes:     {total_classes}");

    let dense = QdrantDenseIndex::new(&config.dense_index.url, &config.dense_index.collection);
    match dense {
        Ok(dense) => match dense.count().await {
            Ok(n) => println!("  Dense index: {n} points ({})", config.dense_index.collection),
            Err(e) => println!("  Dense index: unreachable ({e})"),
        },
        Err(e) => println!("  Dense index: unreachable ({e})"),
    }

    let lexical = TantivyLexicalIndex::new(&config.lexical_index.path);
    println!("  Lexical index: {} documents", lexical.num_docs());

    println!();

    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
