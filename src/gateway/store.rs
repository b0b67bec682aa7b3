//! Session persistence and the deterministic-point-id payload cache.
//!
//! `SessionStore` abstracts over an in-process map (the default — a
//! coarse-locked thread-safe map, matching spec.md §5's concurrency note)
//! and a shared Redis-backed store (feature `gateway-redis`) with
//! identical TTL semantics, so a gateway fleet can share session state.

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::models::ChunkPayload;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CourseInfo {
    pub chunk_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationState {
    pub active_entity_id: Option<String>,
    pub active_entity_name: Option<String>,
    pub active_entity_type: Option<String>,
    pub active_course: Option<CourseInfo>,
    pub last_sources: Vec<String>,
    /// Payload snapshots parallel to `last_sources`, cached so a repeat
    /// follow-up doesn't need another point fetch.
    #[serde(default)]
    pub last_payloads: Vec<ChunkPayload>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<ConversationState>>;
    async fn put(&self, session_id: &str, state: ConversationState, ttl: Duration) -> Result<()>;
}

/// Default backend: a coarse-locked in-process map. Entries expire lazily
/// on read (no background sweeper) — acceptable for a single-process
/// gateway instance.
pub struct InProcessSessionStore {
    entries: RwLock<HashMap<String, (ConversationState, Instant)>>,
}

impl Default for InProcessSessionStore {
    fn default() -> Self {
        InProcessSessionStore { entries: RwLock::new(HashMap::new()) }
    }
}

impl InProcessSessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InProcessSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<ConversationState>> {
        let entries = self.entries.read().await;
        match entries.get(session_id) {
            Some((state, expires_at)) if *expires_at > Instant::now() => Ok(Some(state.clone())),
            _ => Ok(None),
        }
    }

    async fn put(&self, session_id: &str, state: ConversationState, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(session_id.to_string(), (state, Instant::now() + ttl));
        Ok(())
    }
}

#[cfg(feature = "gateway-redis")]
pub struct RedisSessionStore {
    client: redis::Client,
}

#[cfg(feature = "gateway-redis")]
impl RedisSessionStore {
    pub fn new(url: &str) -> Result<Self> {
        Ok(RedisSessionStore { client: redis::Client::open(url)? })
    }

    fn key(session_id: &str) -> String {
        format!("session:{session_id}")
    }
}

#[cfg(feature = "gateway-redis")]
#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<ConversationState>> {
        let mut conn = self.client.get_connection_manager().await?;
        let raw: Option<String> = redis::AsyncCommands::get(&mut conn, Self::key(session_id)).await?;
        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }

    async fn put(&self, session_id: &str, state: ConversationState, ttl: Duration) -> Result<()> {
        let mut conn = self.client.get_connection_manager().await?;
        let raw = serde_json::to_string(&state)?;
        let _: () = redis::AsyncCommands::set_ex(&mut conn, Self::key(session_id), raw, ttl.as_secs()).await?;
        Ok(())
    }
}

/// Deterministic-point-id payload cache: LRU-bounded with a per-entry TTL.
/// Checked before the slow chunk-id scroll path.
pub struct PayloadCache {
    inner: std::sync::Mutex<LruCache<String, (ChunkPayload, Instant)>>,
    ttl: Duration,
}

impl PayloadCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        PayloadCache {
            inner: std::sync::Mutex::new(LruCache::new(NonZeroUsize::new(max_entries.max(1)).unwrap())),
            ttl,
        }
    }

    pub fn get(&self, chunk_id: &str) -> Option<ChunkPayload> {
        let mut guard = self.inner.lock().unwrap();
        match guard.get(chunk_id) {
            Some((payload, inserted_at)) if inserted_at.elapsed() < self.ttl => Some(payload.clone()),
            Some(_) => {
                guard.pop(chunk_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, chunk_id: String, payload: ChunkPayload) {
        self.inner.lock().unwrap().put(chunk_id, (payload, Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkType;

    #[tokio::test]
    async fn in_process_store_roundtrips_within_ttl() {
        let store = InProcessSessionStore::new();
        let state = ConversationState {
            active_entity_name: Some("Databases and SQL".to_string()),
            ..Default::default()
        };
        store.put("s1", state.clone(), Duration::from_secs(60)).await.unwrap();
        let fetched = store.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched.active_entity_name, Some("Databases and SQL".to_string()));
    }

    #[tokio::test]
    async fn in_process_store_expires_entries() {
        let store = InProcessSessionStore::new();
        store.put("s1", ConversationState::default(), Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("s1").await.unwrap().is_none());
    }

    fn payload(id: &str) -> ChunkPayload {
        ChunkPayload {
            chunk_id: id.to_string(),
            title: "T".to_string(),
            chunk_type: ChunkType::Topic,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn payload_cache_hit_then_expiry() {
        let cache = PayloadCache::new(10, Duration::from_millis(20));
        cache.put("A".to_string(), payload("A"));
        assert!(cache.get("A").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("A").is_none());
    }
}
