// In-memory engine used by registry and gateway tests
use crate::api::middleware::AppError;
use crate::models::{
    ConnectionStatus, DataSourceConfig, DataSourceType, QueryResult, Row, SchemaColumn,
    SchemaTable, TableType,
};
use crate::services::database::adapter::{BuildAdapter, DatabaseAdapter, StatusTracker};
use crate::services::database::PoolSettings;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Behaviour is driven by `mock_*` connection options:
/// `mock_fail_connect`, `mock_rows`, `mock_error`, `mock_delay_ms`.
pub struct MockAdapter {
    pub config: DataSourceConfig,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub executions: AtomicUsize,
    pub last_query: std::sync::Mutex<Option<String>>,
    connected: AtomicBool,
    status: StatusTracker,
}

impl MockAdapter {
    fn flag(&self, key: &str) -> bool {
        self.config
            .connection_options
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn number(&self, key: &str, default: u64) -> u64 {
        self.config
            .connection_options
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn require_connected(&self) -> Result<(), AppError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AppError::Connection("not connected".to_string()))
        }
    }
}

impl BuildAdapter for MockAdapter {
    fn build(config: &DataSourceConfig, _settings: &PoolSettings) -> Result<Self, AppError> {
        config.engine()?;
        Ok(Self {
            config: config.clone(),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            executions: AtomicUsize::new(0),
            last_query: std::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            status: StatusTracker::default(),
        })
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for MockAdapter {
    fn engine(&self) -> DataSourceType {
        self.config.engine().unwrap_or(DataSourceType::PostgreSQL)
    }

    async fn connect(&self) -> Result<(), AppError> {
        if self.is_connected() {
            return Ok(());
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.flag("mock_fail_connect") {
            self.status.record_failure("connection refused");
            return Err(AppError::Connection("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.status.mark_connected();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AppError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        self.status.mark_disconnected();
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        self.connect().await.is_ok()
    }

    async fn get_schemas(&self) -> Result<Vec<String>, AppError> {
        self.require_connected()?;
        Ok(vec!["public".to_string(), "sales".to_string()])
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<SchemaTable>, AppError> {
        self.require_connected()?;
        let schema = schema.unwrap_or("public").to_string();
        Ok(vec![SchemaTable::new("users", Some(schema), TableType::Table)])
    }

    async fn get_table_schema(
        &self,
        table: &str,
        _schema: Option<&str>,
    ) -> Result<Vec<SchemaColumn>, AppError> {
        self.require_connected()?;
        if table != "users" {
            return Err(AppError::Execution(format!("relation \"{}\" does not exist", table)));
        }
        Ok(vec![SchemaColumn {
            name: "id".to_string(),
            data_type: "integer".to_string(),
            nullable: false,
            is_primary_key: true,
            is_foreign_key: false,
            default_value: None,
            comment: None,
        }])
    }

    async fn execute_query(&self, text: &str) -> Result<QueryResult, AppError> {
        self.require_connected()?;
        self.executions.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock().unwrap() = Some(text.to_string());

        let delay = self.number("mock_delay_ms", 0);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if let Some(message) = self.config.connection_options.get("mock_error").and_then(|v| v.as_str()) {
            return Err(AppError::Execution(message.to_string()));
        }

        let rows: Vec<Row> = (0..self.number("mock_rows", 1))
            .map(|n| json!({ "n": n }).as_object().cloned().unwrap_or_default())
            .collect();
        Ok(QueryResult::new(vec!["n".to_string()], rows, 1))
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.status.snapshot()
    }

    fn preview_query(&self, table: &str, schema: Option<&str>, limit: usize) -> String {
        format!("SELECT * FROM {}.{} LIMIT {}", schema.unwrap_or("public"), table, limit)
    }
}
