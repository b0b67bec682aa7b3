//! Core Query API HTTP server.
//!
//! Exposes the retrieval-and-routing engine over JSON HTTP: `POST /ask`
//! runs a query through the `RetrievalOrchestrator`; `GET /courses/schedule`
//! backs the session gateway's course-schedule shortcut. Error contract and
//! CORS setup reused from the teacher's MCP server.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::dense_index::QdrantDenseIndex;
use crate::embedder::create_embedder;
use crate::generative::create_provider;
use crate::lexical_index::TantivyLexicalIndex;
use crate::models::{QueryResult, Turn};
use crate::orchestrator::RetrievalOrchestrator;
use crate::relational_store::{CourseSchedule, RelationalStore, SqliteRelationalStore};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<RetrievalOrchestrator>,
    relational_store: Arc<dyn RelationalStore>,
}

pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let pool = crate::db::connect(config).await?;
    let embedder: Arc<dyn crate::embedder::Embedder> = Arc::from(create_embedder(&config.embedding)?);
    let dense_index = Arc::new(QdrantDenseIndex::new(&config.dense_index.url, &config.dense_index.collection)?);
    let lexical_index = Arc::new(TantivyLexicalIndex::new(&config.lexical_index.path));
    let relational_store = Arc::new(SqliteRelationalStore::new(pool));
    let cross_encoder: Arc<dyn crate::cross_encoder::CrossEncoder> =
        Arc::new(crate::cross_encoder::BiEncoderFallback::new(embedder.clone()));
    let generative: Arc<dyn crate::generative::GenerativeProvider> = Arc::from(create_provider(&config.generative)?);

    let orchestrator = Arc::new(RetrievalOrchestrator::new(
        embedder,
        dense_index,
        lexical_index,
        relational_store.clone(),
        cross_encoder,
        generative,
        config.retrieval.clone(),
    ));

    let state = AppState {
        orchestrator,
        relational_store,
    };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/ask", post(handle_ask))
        .route("/courses/schedule", get(handle_course_schedule))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(bind = %bind_addr, "core query server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

#[derive(Deserialize)]
struct AskRequest {
    query: String,
    #[serde(default)]
    history: Option<Vec<Turn>>,
}

async fn handle_ask(State(state): State<AppState>, Json(req): Json<AskRequest>) -> Result<Json<QueryResult>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    let result = state
        .orchestrator
        .ask(&req.query, req.history.as_deref())
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(result))
}

#[derive(Serialize)]
struct ScheduleRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    earliest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest: Option<String>,
}

#[derive(Serialize)]
struct CourseScheduleResponse {
    found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    course_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<ScheduleRange>,
}

impl From<CourseSchedule> for CourseScheduleResponse {
    fn from(cs: CourseSchedule) -> Self {
        CourseScheduleResponse {
            found: true,
            course_code: Some(cs.course_code),
            range: Some(ScheduleRange {
                earliest: cs.earliest,
                latest: cs.latest,
            }),
        }
    }
}

async fn handle_course_schedule(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<CourseScheduleResponse>, AppError> {
    let course_code = params.get("course_code").map(|s| s.as_str());
    let title = params.get("title").map(|s| s.as_str());
    if course_code.is_none() && title.is_none() {
        return Err(bad_request("course_code or title is required"));
    }

    let schedule = state
        .relational_store
        .course_schedule(course_code, title)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(match schedule {
        Some(cs) => cs.into(),
        None => CourseScheduleResponse {
            found: false,
            course_code: None,
            range: None,
        },
    }))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_serializes_with_error_envelope() {
        let err = bad_request("bad query");
        let body = ErrorBody {
            error: ErrorDetail {
                code: err.code,
                message: err.message,
            },
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"code\":\"bad_request\""));
        assert!(json.contains("\"message\":\"bad query\""));
    }
}
