// Engine adapters behind one capability contract
pub mod adapter;
#[cfg(test)]
pub(crate) mod mock;
pub mod mongodb;
pub mod mysql;
pub mod postgresql;

pub use adapter::{BuildAdapter, DatabaseAdapter, StatusTracker};
pub use mongodb::MongoDBAdapter;
pub use mysql::MySQLAdapter;
pub use postgresql::PostgreSQLAdapter;

use crate::api::middleware::AppError;
use crate::models::{
    ConnectionStatus, DataSourceConfig, DataSourceType, QueryResult, SchemaColumn, SchemaTable,
};
use serde_json::Value;
use std::time::Duration;

/// Pool sizing and timeouts applied when an adapter opens its pool
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_size: usize,
    pub min_idle: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    /// Documents sampled when inferring a collection's fields
    pub sample_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 2,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            sample_size: 100,
        }
    }
}

impl PoolSettings {
    /// Apply per-source overrides from `connection_options`
    pub fn for_source(&self, config: &DataSourceConfig) -> PoolSettings {
        let mut settings = self.clone();

        for (key, value) in &config.connection_options {
            match key.as_str() {
                "max_pool_size" => {
                    if let Some(v) = option_u64(value) {
                        settings.max_size = v as usize;
                    }
                }
                "min_idle" => {
                    if let Some(v) = option_u64(value) {
                        settings.min_idle = v as usize;
                    }
                }
                "connect_timeout_secs" => {
                    if let Some(v) = option_u64(value) {
                        settings.connect_timeout = Duration::from_secs(v);
                    }
                }
                "idle_timeout_secs" => {
                    if let Some(v) = option_u64(value) {
                        settings.idle_timeout = Duration::from_secs(v);
                    }
                }
                "application_name" | "auth_source" | "replica_set" | "app_name" => {}
                other => {
                    tracing::debug!("Ignoring unknown connection option '{}' for {}", other, config.id);
                }
            }
        }

        settings.max_size = settings.max_size.max(1);
        settings.min_idle = settings.min_idle.min(settings.max_size);
        settings
    }
}

/// Read a numeric option given either as a JSON number or a numeric string
fn option_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read a string option, skipping blanks
pub(crate) fn option_str<'a>(config: &'a DataSourceConfig, key: &str) -> Option<&'a str> {
    config
        .connection_options
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Closed set of engines a data source can point at
pub enum DataSourceAdapter {
    Postgres(PostgreSQLAdapter),
    MySql(MySQLAdapter),
    MongoDb(MongoDBAdapter),
}

macro_rules! dispatch {
    ($self:ident, $adapter:ident => $body:expr) => {
        match $self {
            DataSourceAdapter::Postgres($adapter) => $body,
            DataSourceAdapter::MySql($adapter) => $body,
            DataSourceAdapter::MongoDb($adapter) => $body,
        }
    };
}

#[async_trait::async_trait]
impl DatabaseAdapter for DataSourceAdapter {
    fn engine(&self) -> DataSourceType {
        dispatch!(self, a => a.engine())
    }

    async fn connect(&self) -> Result<(), AppError> {
        dispatch!(self, a => a.connect().await)
    }

    async fn disconnect(&self) -> Result<(), AppError> {
        dispatch!(self, a => a.disconnect().await)
    }

    async fn test_connection(&self) -> bool {
        dispatch!(self, a => a.test_connection().await)
    }

    async fn get_schemas(&self) -> Result<Vec<String>, AppError> {
        dispatch!(self, a => a.get_schemas().await)
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<SchemaTable>, AppError> {
        dispatch!(self, a => a.get_tables(schema).await)
    }

    async fn get_table_schema(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<SchemaColumn>, AppError> {
        dispatch!(self, a => a.get_table_schema(table, schema).await)
    }

    async fn execute_query(&self, text: &str) -> Result<QueryResult, AppError> {
        dispatch!(self, a => a.execute_query(text).await)
    }

    fn connection_status(&self) -> ConnectionStatus {
        dispatch!(self, a => a.connection_status())
    }

    fn preview_query(&self, table: &str, schema: Option<&str>, limit: usize) -> String {
        dispatch!(self, a => a.preview_query(table, schema, limit))
    }
}

impl BuildAdapter for DataSourceAdapter {
    fn build(config: &DataSourceConfig, settings: &PoolSettings) -> Result<Self, AppError> {
        create_adapter(config, settings)
    }
}

/// Factory: pick the adapter for the config's engine type
pub fn create_adapter(
    config: &DataSourceConfig,
    settings: &PoolSettings,
) -> Result<DataSourceAdapter, AppError> {
    let settings = settings.for_source(config);
    match config.engine()? {
        DataSourceType::PostgreSQL => Ok(DataSourceAdapter::Postgres(PostgreSQLAdapter::new(config, settings)?)),
        DataSourceType::MySQL => Ok(DataSourceAdapter::MySql(MySQLAdapter::new(config, settings)?)),
        DataSourceType::MongoDB => Ok(DataSourceAdapter::MongoDb(MongoDBAdapter::new(config, settings)?)),
    }
}

/// Shared construction checks for every engine
pub(crate) fn validate_config(config: &DataSourceConfig) -> Result<(), AppError> {
    if config.host.trim().is_empty() {
        return Err(AppError::Configuration(format!(
            "Data source '{}' has no host",
            config.name
        )));
    }
    if config.port == 0 {
        return Err(AppError::Configuration(format!(
            "Data source '{}' has an invalid port",
            config.name
        )));
    }
    if config.database.trim().is_empty() {
        return Err(AppError::Configuration(format!(
            "Data source '{}' has no database",
            config.name
        )));
    }
    Ok(())
}
