use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{QueryOutcome, QueryResponse};

#[derive(Debug, Deserialize)]
pub struct SchemaParams {
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PreviewParams {
    pub schema: Option<String>,
    pub limit: Option<usize>,
}

pub async fn get_schemas(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let schemas = state.gateway.get_schemas(&id).await?;

    Ok(Json(serde_json::json!({
        "schemas": schemas
    })))
}

pub async fn get_tables(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SchemaParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::debug!("Listing tables for data source {}", id);
    let tables = state.gateway.get_tables(&id, params.schema.as_deref()).await?;

    Ok(Json(serde_json::json!({
        "tables": tables
    })))
}

pub async fn get_table_columns(
    State(state): State<AppState>,
    Path((id, table)): Path<(String, String)>,
    Query(params): Query<SchemaParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let columns = state
        .gateway
        .get_table_schema(&id, &table, params.schema.as_deref())
        .await?;

    Ok(Json(serde_json::json!({
        "table": table,
        "columns": columns
    })))
}

/// First rows of a table, in the same shape as a query response
pub async fn preview_table(
    State(state): State<AppState>,
    Path((id, table)): Path<(String, String)>,
    Query(params): Query<PreviewParams>,
) -> Result<Json<QueryResponse>, AppError> {
    let result = state
        .gateway
        .preview_table(&id, &table, params.schema.as_deref(), params.limit)
        .await?;

    Ok(Json(QueryResponse::from(QueryOutcome {
        result,
        cached: false,
    })))
}
