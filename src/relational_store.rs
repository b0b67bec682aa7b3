//! Relational store: the source of truth for chunk text and structured
//! facts. All reads are parameterized; this module exclusively owns Chunk
//! rows and the curriculum tables (`courses`, `topics`, `classes`,
//! `assignments`, `assignment_topics`).

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::models::{Chunk, ChunkType};

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>>;
    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>>;
    async fn list_all_chunks(&self) -> Result<Vec<Chunk>>;

    async fn list_courses(&self) -> Result<Vec<CourseRow>>;
    async fn list_topics(&self, course_code: Option<&str>) -> Result<Vec<TopicRow>>;
    async fn learned_at_range(&self, topic_code: &str) -> Result<Option<LearnedRange>>;
    async fn count_classes_for_topic(&self, topic_code: &str) -> Result<Option<i64>>;
    async fn course_schedule(&self, course_code: Option<&str>, title: Option<&str>) -> Result<Option<CourseSchedule>>;
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CourseRow {
    pub id: String,
    pub code: String,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TopicRow {
    pub id: String,
    pub course_id: String,
    pub code: String,
    pub title: String,
    pub position: i64,
}

#[derive(Debug, Clone)]
pub struct LearnedRange {
    pub earliest: Option<String>,
    pub latest: Option<String>,
}

/// Result of the course-schedule read: the resolved course code alongside
/// the earliest/latest class dates, backing the Query API's `GET
/// /courses/schedule` and the gateway's course-schedule shortcut.
#[derive(Debug, Clone)]
pub struct CourseSchedule {
    pub course_code: String,
    pub earliest: Option<String>,
    pub latest: Option<String>,
}

pub struct SqliteRelationalStore {
    pool: SqlitePool,
}

impl SqliteRelationalStore {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteRelationalStore { pool }
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
        let chunk_type_str: String = row.try_get("chunk_type")?;
        let metadata_json: String = row.try_get("metadata")?;
        Ok(Chunk {
            chunk_id: row.try_get("chunk_id")?,
            chunk_type: parse_chunk_type(&chunk_type_str),
            title: row.try_get("title")?,
            text: row.try_get("text")?,
            metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
            created_at: row.try_get("created_at")?,
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
impl RelationalStore for SqliteRelationalStore {
    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT chunk_id, chunk_type, title, text, metadata, created_at FROM chunks WHERE chunk_id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_chunk).transpose()
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = chunk_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT chunk_id, chunk_type, title, text, metadata, created_at FROM chunks WHERE chunk_id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in chunk_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_chunk).collect()
    }

    async fn list_all_chunks(&self) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT chunk_id, chunk_type, title, text, metadata, created_at FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_chunk).collect()
    }

    async fn list_courses(&self) -> Result<Vec<CourseRow>> {
        Ok(sqlx::query_as::<_, CourseRow>("SELECT id, code, title, description FROM courses ORDER BY code")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn list_topics(&self, course_code: Option<&str>) -> Result<Vec<TopicRow>> {
        match course_code {
            Some(code) => Ok(sqlx::query_as::<_, TopicRow>(
                "SELECT t.id, t.course_id, t.code, t.title, t.position FROM topics t \
                 JOIN courses c ON c.id = t.course_id WHERE c.code = ? ORDER BY t.position",
            )
            .bind(code)
            .fetch_all(&self.pool)
            .await?),
            None => Ok(sqlx::query_as::<_, TopicRow>("SELECT id, course_id, code, title, position FROM topics ORDER BY position")
                .fetch_all(&self.pool)
                .await?),
        }
    }

    async fn learned_at_range(&self, topic_code: &str) -> Result<Option<LearnedRange>> {
        let row = sqlx::query(
            "SELECT MIN(cl.learned_at) AS earliest, MAX(cl.learned_at) AS latest \
             FROM classes cl JOIN topics t ON t.id = cl.topic_id WHERE t.code = ?",
        )
        .bind(topic_code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| LearnedRange {
            earliest: r.try_get("earliest").ok(),
            latest: r.try_get("latest").ok(),
        }))
    }

    async fn count_classes_for_topic(&self, topic_code: &str) -> Result<Option<i64>> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT COUNT(*) FROM classes cl JOIN topics t ON t.id = cl.topic_id WHERE t.code = ?",
        )
        .bind(topic_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count)
    }

    async fn course_schedule(&self, course_code: Option<&str>, title: Option<&str>) -> Result<Option<CourseSchedule>> {
        let row = if let Some(code) = course_code {
            sqlx::query(
                "SELECT c.code AS course_code, MIN(cl.learned_at) AS earliest, MAX(cl.learned_at) AS latest \
                 FROM classes cl JOIN topics t ON t.id = cl.topic_id JOIN courses c ON c.id = t.course_id \
                 WHERE c.code = ? GROUP BY c.code",
            )
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
        } else if let Some(title) = title {
            sqlx::query(
                "SELECT c.code AS course_code, MIN(cl.learned_at) AS earliest, MAX(cl.learned_at) AS latest \
                 FROM classes cl JOIN topics t ON t.id = cl.topic_id JOIN courses c ON c.id = t.course_id \
                 WHERE c.title = ? GROUP BY c.code",
            )
            .bind(title)
            .fetch_optional(&self.pool)
            .await?
        } else {
            return Ok(None);
        };

        Ok(row.map(|r| CourseSchedule {
            course_code: r.try_get("course_code").unwrap_or_default(),
            earliest: r.try_get("earliest").ok(),
            latest: r.try_get("latest").ok(),
        }))
    }
}
