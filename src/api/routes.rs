use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{datasource, metadata, query, AppState};

/// Create router with application state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/data-sources",
            get(datasource::list_data_sources).post(datasource::create_data_source),
        )
        .route(
            "/api/data-sources/{id}",
            get(datasource::get_data_source)
                .put(datasource::update_data_source)
                .delete(datasource::delete_data_source),
        )
        .route("/api/data-sources/{id}/test", post(datasource::test_connection))
        .route("/api/data-sources/{id}/status", get(datasource::connection_status))
        .route("/api/data-sources/{id}/schemas", get(metadata::get_schemas))
        .route("/api/data-sources/{id}/tables", get(metadata::get_tables))
        .route(
            "/api/data-sources/{id}/tables/{table}/columns",
            get(metadata::get_table_columns),
        )
        .route(
            "/api/data-sources/{id}/tables/{table}/preview",
            get(metadata::preview_table),
        )
        .route("/api/data-sources/{id}/query", post(query::execute_query))
        .route("/api/data-sources/{id}/cache", delete(query::clear_source_cache))
        .route("/api/cache", delete(query::clear_all_cache))
        .route("/api/adapters", get(query::list_adapters))
        .route("/api/adapters/close-all", post(query::close_all_adapters))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
