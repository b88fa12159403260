use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Result as SqliteResult, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::api::middleware::AppError;
use crate::models::DataSourceConfig;
use crate::storage::ConfigStore;

const SELECT_COLUMNS: &str = "id, name, source_type, host, port, database_name, username, password, ssl, connection_options, created_at, updated_at";

/// SQLite-backed store of data source records
/// Uses tokio::Mutex for async-friendly locking
pub struct SqliteConfigStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConfigStore {
    /// Open (or create) the store at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path: &str = if path_str.starts_with("sqlite:") {
            path_str.trim_start_matches("sqlite:").trim_start_matches("//")
        } else {
            path_str.as_ref()
        };

        let conn = Connection::open(clean_path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store, used by tests and throwaway runs
    pub async fn in_memory() -> SqliteResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS data_sources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                source_type TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                database_name TEXT NOT NULL,
                username TEXT,
                password TEXT,
                ssl INTEGER NOT NULL DEFAULT 0,
                connection_options TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_data_sources_created ON data_sources(created_at DESC)",
            [],
        )?;

        Ok(())
    }

    fn row_to_config(row: &Row<'_>) -> SqliteResult<DataSourceConfig> {
        let options_json: String = row.get(9)?;
        let connection_options: HashMap<String, serde_json::Value> =
            serde_json::from_str(&options_json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

        Ok(DataSourceConfig {
            id: row.get(0)?,
            name: row.get(1)?,
            source_type: row.get(2)?,
            host: row.get(3)?,
            port: row.get(4)?,
            database: row.get(5)?,
            username: row.get(6)?,
            password: row.get(7)?,
            ssl: row.get(8)?,
            connection_options,
            created_at: parse_timestamp(row, 10)?,
            updated_at: parse_timestamp(row, 11)?,
        })
    }
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> SqliteResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn get(&self, id: &str) -> Result<Option<DataSourceConfig>, AppError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM data_sources WHERE id = ?1",
            SELECT_COLUMNS
        ))?;

        let mut rows = stmt.query_map([id], Self::row_to_config)?;
        match rows.next() {
            Some(config) => Ok(Some(config?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<DataSourceConfig>, AppError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM data_sources ORDER BY created_at DESC",
            SELECT_COLUMNS
        ))?;

        let rows = stmt.query_map([], Self::row_to_config)?;
        let mut configs = Vec::new();
        for row in rows {
            configs.push(row?);
        }
        Ok(configs)
    }

    async fn save(&self, config: &DataSourceConfig) -> Result<(), AppError> {
        let options = serde_json::to_string(&config.connection_options)
            .map_err(|e| AppError::Internal(format!("Failed to encode connection options: {}", e)))?;

        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO data_sources
            (id, name, source_type, host, port, database_name, username, password, ssl, connection_options, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            rusqlite::params![
                config.id,
                config.name,
                config.source_type,
                config.host,
                config.port,
                config.database,
                config.username,
                config.password,
                config.ssl,
                options,
                config.created_at.to_rfc3339(),
                config.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let conn = self.conn.lock().await;
        let affected = conn.execute("DELETE FROM data_sources WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample() -> DataSourceConfig {
        DataSourceConfig::new("Warehouse", "postgresql", "db.internal", 5432, "analytics")
            .with_credentials("reader", "s3cret")
            .with_option("max_pool_size", json!(4))
    }

    #[test]
    fn test_store_creation() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let store = tokio_test::block_on(SqliteConfigStore::new(&db_path));
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_sqlite_url_prefix_is_stripped() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("prefixed.db");
        let url = format!("sqlite://{}", db_path.display());

        let store = SqliteConfigStore::new(&url).await.unwrap();
        store.save(&sample()).await.unwrap();
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_save_and_get_round_trip() {
        let store = SqliteConfigStore::in_memory().await.unwrap();
        let config = sample();
        store.save(&config).await.unwrap();

        let loaded = store.get(&config.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Warehouse");
        assert_eq!(loaded.port, 5432);
        assert_eq!(loaded.password.as_deref(), Some("s3cret"));
        assert_eq!(loaded.connection_options.get("max_pool_size"), Some(&json!(4)));
        assert_eq!(loaded.created_at.timestamp(), config.created_at.timestamp());

        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_existing_record() {
        let store = SqliteConfigStore::in_memory().await.unwrap();
        let mut config = sample();
        store.save(&config).await.unwrap();

        config.host = "replica.internal".to_string();
        config.ssl = true;
        store.save(&config).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].host, "replica.internal");
        assert!(all[0].ssl);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SqliteConfigStore::in_memory().await.unwrap();
        let config = sample();
        store.save(&config).await.unwrap();

        assert!(store.delete(&config.id).await.unwrap());
        assert!(!store.delete(&config.id).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("persist.db");
        let config = sample();

        {
            let store = SqliteConfigStore::new(&db_path).await.unwrap();
            store.save(&config).await.unwrap();
        }

        let reopened = SqliteConfigStore::new(&db_path).await.unwrap();
        let loaded = reopened.get(&config.id).await.unwrap();
        assert!(loaded.is_some());
    }
}
