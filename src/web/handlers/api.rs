use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::pipeline::models::{QueryRequest, QueryResponse};
use crate::web::state::AppState;

#[derive(Debug, Serialize)]
pub struct PredefinedSummary {
    pub key: String,
    pub question: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub table_count: usize,
    pub llm_available: bool,
}

pub async fn run_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Json<QueryResponse> {
    info!("Query received: {}", request.question);
    let response = state.orchestrator().handle(request).await;
    Json(response)
}

// Registry listing; SQL stays server-side.
pub async fn list_predefined(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PredefinedSummary>>, (StatusCode, String)> {
    let entries = state.orchestrator().matcher().list().await.map_err(|e| {
        error!("Failed to list predefined queries: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e))
    })?;

    Ok(Json(
        entries
            .into_iter()
            .map(|q| PredefinedSummary {
                key: q.key,
                question: q.question,
                description: q.description,
            })
            .collect(),
    ))
}

pub async fn get_schema(
    State(state): State<Arc<AppState>>,
) -> Result<Json<String>, (StatusCode, String)> {
    let text = state.orchestrator().schema().schema_text().await.map_err(|e| {
        error!("Failed to render schema: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e))
    })?;
    Ok(Json(text))
}

pub async fn system_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SystemStatus>, (StatusCode, String)> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds();

    let tables = state.orchestrator().schema().list_tables().await.map_err(|e| {
        error!("Failed to get table count: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
    })?;

    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        table_count: tables.len(),
        llm_available: state.llm_manager.is_available(),
    }))
}
