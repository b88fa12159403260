pub mod sqlite;

pub use sqlite::SqliteConfigStore;

use async_trait::async_trait;

use crate::api::middleware::AppError;
use crate::models::DataSourceConfig;

/// Persistence for data source records, keyed by id
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<DataSourceConfig>, AppError>;

    /// All records, newest first
    async fn list(&self) -> Result<Vec<DataSourceConfig>, AppError>;

    /// Insert or replace by id
    async fn save(&self, config: &DataSourceConfig) -> Result<(), AppError>;

    /// Returns whether a record was removed
    async fn delete(&self, id: &str) -> Result<bool, AppError>;
}
