use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{QueryRequest, QueryResponse};

/// Validate and execute query text against a data source
pub async fn execute_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    tracing::info!("Executing query for data source: {}", id);

    let outcome = state
        .gateway
        .execute(&id, &payload.query, payload.use_cache)
        .await?;

    Ok(Json(QueryResponse::from(outcome)))
}

pub async fn clear_source_cache(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let cleared = state.gateway.clear_cache(Some(&id)).await;

    Ok(Json(serde_json::json!({
        "cleared": cleared
    })))
}

pub async fn clear_all_cache(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let cleared = state.gateway.clear_cache(None).await;
    tracing::info!("Cleared {} cached results", cleared);

    Ok(Json(serde_json::json!({
        "cleared": cleared
    })))
}

/// Ids of data sources with a live adapter, plus the cache backend in use
pub async fn list_adapters(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let active = state.gateway.active_ids().await;

    Ok(Json(serde_json::json!({
        "active": active,
        "cache": state.gateway.cache().backend_name()
    })))
}

pub async fn close_all_adapters(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let closed = state.gateway.active_ids().await.len();
    state.gateway.close_all().await;

    Ok(Json(serde_json::json!({
        "closed": closed
    })))
}
