//! Session gateway HTTP server.
//!
//! A second axum application (`ctx serve gateway`), grounded on the core
//! server's axum/AppError/CORS shell (`src/server.rs`). Resolves a session
//! id per request, rewrites context-dependent follow-up queries against
//! the session's prior entity, forwards to the core Query API, and
//! refreshes session state from the returned source ids -- including the
//! course-schedule shortcut for a prior class's owning course.

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::Config;
use crate::dense_index::{DenseIndex, QdrantDenseIndex};
use crate::gateway::rewrite;
use crate::gateway::store::{ConversationState, CourseInfo, InProcessSessionStore, PayloadCache, SessionStore};
#[cfg(feature = "gateway-redis")]
use crate::gateway::store::RedisSessionStore;
use crate::models::{ChunkPayload, ChunkType, Confidence, Intent, QueryResult, Turn};
use crate::point_id::deterministic_point_id;

const SESSION_HEADER: &str = "x-session-id";
const API_KEY_HEADER: &str = "x-api-key";
const SESSION_COOKIE: &str = "ctx_session";
const MAX_SOURCES_TO_RESOLVE: usize = 5;

struct AppState {
    session_store: Arc<dyn SessionStore>,
    payload_cache: Arc<PayloadCache>,
    dense_index: Arc<dyn DenseIndex>,
    http: reqwest::Client,
    backend_url: String,
    session_ttl: Duration,
    metrics_handle: PrometheusHandle,
}

pub async fn run_gateway(config: &Config) -> anyhow::Result<()> {
    let session_store: Arc<dyn SessionStore> = match &config.gateway.shared_kv_url {
        #[cfg(feature = "gateway-redis")]
        Some(url) => Arc::new(RedisSessionStore::new(url)?),
        #[cfg(not(feature = "gateway-redis"))]
        Some(_) => anyhow::bail!("gateway.shared_kv_url is set but the gateway-redis feature is not compiled in"),
        None => Arc::new(InProcessSessionStore::new()),
    };

    let payload_cache = Arc::new(PayloadCache::new(
        config.gateway.payload_cache_max,
        Duration::from_secs(config.gateway.payload_cache_ttl_sec),
    ));

    let dense_index = Arc::new(QdrantDenseIndex::new(&config.dense_index.url, &config.dense_index.collection)?);

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(120))
        .build()?;

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    let state = Arc::new(AppState {
        session_store,
        payload_cache,
        dense_index,
        http,
        backend_url: config.gateway.backend_url.trim_end_matches('/').to_string(),
        session_ttl: Duration::from_secs(config.gateway.session_ttl_sec),
        metrics_handle,
    });

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/ask", post(handle_ask))
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/metrics", get(handle_metrics))
        .layer(cors)
        .with_state(state);

    tracing::info!(bind = %config.gateway.bind, backend = %config.gateway.backend_url, "session gateway listening");

    let listener = tokio::net::TcpListener::bind(&config.gateway.bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": { "code": self.code, "message": self.message } });
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::BAD_REQUEST, code: "bad_request".to_string(), message: message.into() }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::INTERNAL_SERVER_ERROR, code: "internal".to_string(), message: message.into() }
}

fn bad_gateway(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::BAD_GATEWAY, code: "backend_error".to_string(), message: message.into() }
}

#[derive(Deserialize)]
struct GatewayAskRequest {
    query: String,
    #[serde(default)]
    history: Option<Vec<Turn>>,
    #[serde(default)]
    session_id: Option<String>,
}

fn extract_session_id(headers: &HeaderMap, body_session_id: Option<&str>) -> Option<String> {
    if let Some(v) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    if let Some(s) = body_session_id {
        if !s.is_empty() {
            return Some(s.to_string());
        }
    }
    if let Some(cookie_header) = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()) {
        let prefix = format!("{SESSION_COOKIE}=");
        for part in cookie_header.split(';') {
            if let Some(rest) = part.trim().strip_prefix(&prefix) {
                return Some(rest.to_string());
            }
        }
    }
    None
}

/// A query about "the course" of the prior class, e.g. "when is the
/// course offered" or "what's the course schedule". The conjunction of a
/// course reference plus a schedule cue distinguishes this from a
/// general follow-up about the class itself.
fn is_course_schedule_query(query: &str) -> bool {
    let lower = query.to_lowercase();
    lower.contains("course") && (lower.contains("schedule") || lower.contains("offered") || lower.contains("when"))
}

async fn handle_ask(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(req): Json<GatewayAskRequest>) -> Result<Response, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let session_id = extract_session_id(&headers, req.session_id.as_deref()).unwrap_or_else(|| Uuid::new_v4().to_string());
    let _span = tracing::info_span!("gateway_ask", session_id = %session_id).entered();

    let prior_state = state
        .session_store
        .get(&session_id)
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .unwrap_or_default();

    if let Some(course) = prior_state.active_course.clone() {
        if is_course_schedule_query(&req.query) {
            metrics::counter!("gateway_course_schedule_lookups_total").increment(1);
            if let Some(schedule) = fetch_course_schedule(&state, &course.title).await? {
                if schedule.found {
                    let sentence = format_schedule_sentence(&course.title, &schedule);
                    let code = schedule.course_code.clone().unwrap_or_default();
                    let result = QueryResult {
                        answer: sentence,
                        sources: vec![format!("SQL:{code}")],
                        intent: Intent::Factual,
                        confidence: Confidence::High,
                        sql: None,
                        retrieval_chain: None,
                    };
                    persist_state(&state, &session_id, prior_state.clone()).await?;
                    return Ok(build_response(result, &session_id, &prior_state, state.session_ttl));
                }
            }
            let rewritten = rewrite::maybe_rewrite(&req.query, Some(&course.title));
            let result = forward_to_backend(&state, &rewritten, req.history.as_deref(), headers.get(API_KEY_HEADER)).await?;
            let new_state = refresh_state(&state, &result, &prior_state).await;
            persist_state(&state, &session_id, new_state.clone()).await?;
            metrics::counter!("gateway_state_updates_total").increment(1);
            return Ok(build_response(result, &session_id, &new_state, state.session_ttl));
        }
    }

    let rewritten_query = rewrite::maybe_rewrite(&req.query, prior_state.active_entity_name.as_deref());
    if rewritten_query != req.query {
        metrics::counter!("gateway_rewrites_total").increment(1);
        tracing::info!(original = %req.query, rewritten = %rewritten_query, "rewrote follow-up query");
    }

    let result = forward_to_backend(&state, &rewritten_query, req.history.as_deref(), headers.get(API_KEY_HEADER)).await?;
    let new_state = refresh_state(&state, &result, &prior_state).await;
    persist_state(&state, &session_id, new_state.clone()).await?;
    metrics::counter!("gateway_state_updates_total").increment(1);

    Ok(build_response(result, &session_id, &new_state, state.session_ttl))
}

async fn persist_state(state: &AppState, session_id: &str, conv: ConversationState) -> Result<(), AppError> {
    state.session_store.put(session_id, conv, state.session_ttl).await.map_err(|e| internal_error(e.to_string()))
}

async fn forward_to_backend(state: &AppState, query: &str, history: Option<&[Turn]>, api_key: Option<&HeaderValue>) -> Result<QueryResult, AppError> {
    let body = serde_json::json!({ "query": query, "history": history });
    let mut request = state.http.post(format!("{}/ask", state.backend_url)).json(&body);
    if let Some(key) = api_key {
        if let Ok(s) = key.to_str() {
            request = request.header(API_KEY_HEADER, s);
        }
    }

    let response = request.send().await.map_err(|e| bad_gateway(format!("backend forward failed: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(bad_gateway(format!("backend responded {status}: {body}")));
    }

    response.json::<QueryResult>().await.map_err(|e| bad_gateway(format!("malformed backend response: {e}")))
}

#[derive(Debug, Deserialize)]
struct ScheduleLookupResponse {
    found: bool,
    #[serde(default)]
    course_code: Option<String>,
    #[serde(default)]
    range: Option<ScheduleRangeLookup>,
}

#[derive(Debug, Deserialize)]
struct ScheduleRangeLookup {
    earliest: Option<String>,
    latest: Option<String>,
}

async fn fetch_course_schedule(state: &AppState, title: &str) -> Result<Option<ScheduleLookupResponse>, AppError> {
    let response = state
        .http
        .get(format!("{}/courses/schedule", state.backend_url))
        .query(&[("title", title)])
        .send()
        .await
        .map_err(|e| bad_gateway(format!("course schedule lookup failed: {e}")))?;

    if !response.status().is_success() {
        return Ok(None);
    }
    response.json::<ScheduleLookupResponse>().await.map(Some).map_err(|e| bad_gateway(format!("malformed course schedule response: {e}")))
}

fn format_schedule_sentence(title: &str, schedule: &ScheduleLookupResponse) -> String {
    match schedule.range.as_ref().and_then(|r| r.earliest.as_ref()) {
        Some(earliest) => {
            let latest = schedule.range.as_ref().and_then(|r| r.latest.clone()).unwrap_or_else(|| earliest.clone());
            format!("{title} runs from {earliest} to {latest}.")
        }
        None => format!("I don't have schedule dates on file for {title}."),
    }
}

/// Resolves payloads for the response's top source ids -- fast path via
/// the deterministic point id (through the payload cache), slow path via
/// a chunk_id scroll -- and updates `active_entity`/`active_course`.
async fn refresh_state(state: &AppState, result: &QueryResult, prior: &ConversationState) -> ConversationState {
    let top_ids: Vec<String> = result.sources.iter().take(MAX_SOURCES_TO_RESOLVE).cloned().collect();
    if top_ids.is_empty() {
        return prior.clone();
    }

    let payloads = resolve_payloads(state, &top_ids).await;
    if payloads.is_empty() {
        return ConversationState {
            last_sources: top_ids,
            ..prior.clone()
        };
    }

    let chosen = payloads
        .iter()
        .find(|p| p.chunk_type == ChunkType::Course)
        .or_else(|| payloads.first())
        .expect("payloads non-empty")
        .clone();

    let active_course = if chosen.chunk_type == ChunkType::Course {
        Some(CourseInfo { chunk_id: chosen.chunk_id.clone(), title: chosen.title.clone() })
    } else if chosen.chunk_type == ChunkType::Class {
        let course_ref = chosen
            .metadata
            .get("course_chunk_id")
            .or_else(|| chosen.metadata.get("course_id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        match course_ref {
            Some(course_chunk_id) => resolve_course_info(state, &course_chunk_id).await.or_else(|| prior.active_course.clone()),
            None => prior.active_course.clone(),
        }
    } else {
        prior.active_course.clone()
    };

    ConversationState {
        active_entity_id: Some(chosen.chunk_id.clone()),
        active_entity_name: Some(chosen.title.clone()),
        active_entity_type: Some(chosen.chunk_type.as_str().to_string()),
        active_course,
        last_sources: top_ids,
        last_payloads: payloads,
    }
}

async fn resolve_payloads(state: &AppState, chunk_ids: &[String]) -> Vec<ChunkPayload> {
    let mut payloads = Vec::with_capacity(chunk_ids.len());
    let mut missing = Vec::new();
    for id in chunk_ids {
        match state.payload_cache.get(id) {
            Some(p) => {
                metrics::counter!("gateway_payload_cache_hits_total").increment(1);
                payloads.push(p);
            }
            None => {
                metrics::counter!("gateway_payload_cache_misses_total").increment(1);
                missing.push(id.clone());
            }
        }
    }
    if missing.is_empty() {
        return payloads;
    }

    let point_ids: Vec<Uuid> = missing.iter().map(|id| deterministic_point_id(id)).collect();
    if let Ok(found) = state.dense_index.get_payloads_by_point_ids(&point_ids).await {
        for (id, point_id) in missing.iter().zip(point_ids.iter()) {
            if let Some(payload) = found.get(point_id) {
                state.payload_cache.put(id.clone(), payload.clone());
                payloads.push(payload.clone());
            }
        }
    }

    let still_missing: Vec<String> = missing.into_iter().filter(|id| !payloads.iter().any(|p| &p.chunk_id == id)).collect();
    if !still_missing.is_empty() {
        if let Ok(scrolled) = state.dense_index.get_points_by_chunk_ids(&still_missing).await {
            for id in &still_missing {
                if let Some(candidate) = scrolled.get(id) {
                    if let Some(payload) = &candidate.payload {
                        state.payload_cache.put(id.clone(), payload.clone());
                        payloads.push(payload.clone());
                    }
                }
            }
        }
    }

    payloads
}

async fn resolve_course_info(state: &AppState, course_chunk_id: &str) -> Option<CourseInfo> {
    let resolved = resolve_payloads(state, std::slice::from_ref(&course_chunk_id.to_string())).await;
    resolved.into_iter().next().map(|p| CourseInfo { chunk_id: p.chunk_id, title: p.title })
}

#[derive(Serialize)]
struct GatewayContext {
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_entity: Option<String>,
}

fn build_response(result: QueryResult, session_id: &str, conv: &ConversationState, ttl: Duration) -> Response {
    let body = serde_json::json!({
        "answer": result.answer,
        "sources": result.sources,
        "intent": result.intent,
        "confidence": result.confidence,
        "sql": result.sql,
        "retrieval_chain": result.retrieval_chain,
        "context": GatewayContext {
            session_id: session_id.to_string(),
            active_entity: conv.active_entity_name.clone(),
        },
    });

    let mut response = Json(body).into_response();
    if let Ok(cookie) = HeaderValue::from_str(&format!("{SESSION_COOKIE}={session_id}; Path=/; Max-Age={}", ttl.as_secs())) {
        response.headers_mut().insert(axum::http::header::SET_COOKIE, cookie);
    }
    response
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn handle_ready(State(state): State<Arc<AppState>>) -> Response {
    let backend_ok = state
        .http
        .get(format!("{}/health", state.backend_url))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false);
    let dense_ok = state.dense_index.count().await.is_ok();

    if backend_ok && dense_ok {
        Json(serde_json::json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "backend": backend_ok, "dense_index": dense_ok })),
        )
            .into_response()
    }
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn course_schedule_query_requires_course_and_schedule_cue() {
        assert!(is_course_schedule_query("When is the course offered?"));
        assert!(is_course_schedule_query("What's the course schedule?"));
        assert!(!is_course_schedule_query("When is it offered?"));
        assert!(!is_course_schedule_query("Describe the course"));
    }

    #[test]
    fn session_id_prefers_header_over_body_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("header-id"));
        assert_eq!(extract_session_id(&headers, Some("body-id")), Some("header-id".to_string()));

        let empty_headers = HeaderMap::new();
        assert_eq!(extract_session_id(&empty_headers, Some("body-id")), Some("body-id".to_string()));

        let mut cookie_headers = HeaderMap::new();
        cookie_headers.insert(axum::http::header::COOKIE, HeaderValue::from_static("other=1; ctx_session=cookie-id"));
        assert_eq!(extract_session_id(&cookie_headers, None), Some("cookie-id".to_string()));

        assert_eq!(extract_session_id(&HeaderMap::new(), None), None);
    }

    #[test]
    fn schedule_sentence_formats_range() {
        let schedule = ScheduleLookupResponse {
            found: true,
            course_code: Some("C1".to_string()),
            range: Some(ScheduleRangeLookup {
                earliest: Some("2025-01-01".to_string()),
                latest: Some("2025-05-01".to_string()),
            }),
        };
        let sentence = format_schedule_sentence("Intro to Databases", &schedule);
        assert_eq!(sentence, "Intro to Databases runs from 2025-01-01 to 2025-05-01.");
    }
}
