use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{DataSourceConfig, DataSourceRequest};

async fn find(state: &AppState, id: &str) -> Result<DataSourceConfig, AppError> {
    state
        .store
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Data source {} not found", id)))
}

/// List all data sources
pub async fn list_data_sources(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let data_sources = state.store.list().await?;

    Ok(Json(serde_json::json!({
        "dataSources": data_sources
    })))
}

/// Register a new data source. No connection is attempted here.
pub async fn create_data_source(
    State(state): State<AppState>,
    Json(payload): Json<DataSourceRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let config = payload.into_config(None)?;
    state.store.save(&config).await?;

    tracing::info!("Created data source {} ({})", config.id, config.redacted_url());

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "dataSource": config
        })),
    ))
}

pub async fn get_data_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let config = find(&state, &id).await?;

    Ok(Json(serde_json::json!({
        "dataSource": config
    })))
}

/// Replace a data source's settings and drop its live adapter and cached results
pub async fn update_data_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<DataSourceRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let existing = find(&state, &id).await?;

    let mut config = payload.into_config(Some(id.clone()))?;
    config.created_at = existing.created_at;
    config.updated_at = Utc::now();
    // Passwords are never sent back to clients, so an omitted one means "unchanged"
    if config.password.is_none() {
        config.password = existing.password;
    }

    state.store.save(&config).await?;
    state.gateway.close_adapter(&id).await;
    let cleared = state.gateway.clear_cache(Some(&id)).await;

    tracing::info!("Updated data source {} (cleared {} cached results)", id, cleared);

    Ok(Json(serde_json::json!({
        "dataSource": config
    })))
}

pub async fn delete_data_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.store.delete(&id).await? {
        return Err(AppError::NotFound(format!("Data source {} not found", id)));
    }

    state.gateway.close_adapter(&id).await;
    state.gateway.clear_cache(Some(&id)).await;
    tracing::info!("Deleted data source {}", id);

    Ok(StatusCode::NO_CONTENT)
}

/// Connect and check the data source
pub async fn test_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    find(&state, &id).await?;
    let status = state.gateway.test_connection(&id).await?;

    Ok(Json(serde_json::json!({
        "success": status.connected,
        "status": status
    })))
}

pub async fn connection_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    find(&state, &id).await?;
    let status = state.gateway.connection_status(&id).await?;

    Ok(Json(serde_json::json!({
        "status": status
    })))
}
