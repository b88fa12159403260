// PostgreSQL adapter using connection pooling for optimal resource management
use crate::api::middleware::AppError;
use crate::models::{
    unique_column_names, ConnectionStatus, DataSourceConfig, DataSourceType, QueryResult, Row,
    SchemaColumn, SchemaTable, TableType,
};
use crate::services::database::adapter::{not_connected, DatabaseAdapter, StatusTracker};
use crate::services::database::{option_str, validate_config, PoolSettings};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, SslMode, Timeouts};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_postgres::types::Type;

const DEFAULT_SCHEMA: &str = "public";

pub struct PostgreSQLAdapter {
    config: DataSourceConfig,
    settings: PoolSettings,
    pool: RwLock<Option<Pool>>,
    status: StatusTracker,
}

impl PostgreSQLAdapter {
    pub fn new(config: &DataSourceConfig, settings: PoolSettings) -> Result<Self, AppError> {
        validate_config(config)?;

        Ok(Self {
            config: config.clone(),
            settings,
            pool: RwLock::new(None),
            status: StatusTracker::default(),
        })
    }

    fn pool_config(&self) -> Config {
        let mut cfg = Config::new();
        cfg.host = Some(self.config.host.clone());
        cfg.port = Some(self.config.port);
        cfg.dbname = Some(self.config.database.clone());
        cfg.user = self.config.username.clone();
        cfg.password = self.config.password.clone();
        cfg.application_name = option_str(&self.config, "application_name").map(str::to_string);
        cfg.connect_timeout = Some(self.settings.connect_timeout);
        cfg.ssl_mode = Some(if self.config.ssl { SslMode::Require } else { SslMode::Disable });
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        // deadpool has no idle reaper; recycle checks stand in for the idle timeout
        let mut pool = PoolConfig::new(self.settings.max_size);
        pool.timeouts = Timeouts {
            wait: Some(self.settings.acquire_timeout),
            create: Some(self.settings.connect_timeout),
            recycle: Some(self.settings.idle_timeout),
        };
        cfg.pool = Some(pool);
        cfg
    }

    fn create_pool(&self) -> Result<Pool, AppError> {
        let cfg = self.pool_config();
        let pool = if self.config.ssl {
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_tls_config());
            cfg.create_pool(Some(Runtime::Tokio1), tls)
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
        };

        pool.map_err(|e| AppError::Configuration(format!("Failed to create PostgreSQL pool: {}", e)))
    }

    /// Get a pooled client, failing when the adapter is not connected
    async fn client(&self) -> Result<deadpool_postgres::Object, AppError> {
        let pool = self
            .pool
            .read()
            .await
            .clone()
            .ok_or_else(|| not_connected(&self.config))?;

        pool.get()
            .await
            .map_err(|e| AppError::Connection(format!("Failed to get connection from pool: {}", e)))
    }

    fn query_error(e: tokio_postgres::Error) -> AppError {
        match e.as_db_error() {
            Some(db_error) => AppError::Execution(db_error.message().to_string()),
            None => AppError::Execution(e.to_string()),
        }
    }
}

/// Build a rustls ClientConfig trusting the Mozilla root set
fn make_tls_config() -> rustls::ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

#[async_trait::async_trait]
impl DatabaseAdapter for PostgreSQLAdapter {
    fn engine(&self) -> DataSourceType {
        DataSourceType::PostgreSQL
    }

    async fn connect(&self) -> Result<(), AppError> {
        if self.pool.read().await.is_some() {
            return Ok(());
        }

        let mut slot = self.pool.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let pool = self.create_pool()?;
        let checked = match pool.get().await {
            Ok(client) => client.simple_query("SELECT 1").await.map(|_| ()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match checked {
            Ok(()) => {
                *slot = Some(pool);
                self.status.mark_connected();
                tracing::info!("Connected to PostgreSQL: {}", self.config.redacted_url());
                Ok(())
            }
            Err(message) => {
                pool.close();
                self.status.record_failure(message.clone());
                tracing::error!(
                    "PostgreSQL connection failed for {}: {}",
                    self.config.redacted_url(),
                    message
                );
                Err(AppError::Connection(message))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), AppError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close();
            tracing::info!("Disconnected from PostgreSQL: {}", self.config.redacted_url());
        }
        self.status.mark_disconnected();
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        if self.connect().await.is_err() {
            return false;
        }

        match self.client().await {
            Ok(client) => match client.simple_query("SELECT 1").await {
                Ok(_) => true,
                Err(e) => {
                    self.status.record_failure(e.to_string());
                    false
                }
            },
            Err(e) => {
                self.status.record_failure(e.to_string());
                false
            }
        }
    }

    async fn get_schemas(&self) -> Result<Vec<String>, AppError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT schema_name::text FROM information_schema.schemata \
                 WHERE schema_name NOT IN ('information_schema', 'pg_catalog', 'pg_toast') \
                 ORDER BY schema_name",
                &[],
            )
            .await
            .map_err(Self::query_error)?;

        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<SchemaTable>, AppError> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT
                    t.table_name::text,
                    t.table_type::text,
                    c.reltuples::bigint AS row_count,
                    pg_total_relation_size(c.oid)::bigint AS size_bytes
                FROM information_schema.tables t
                LEFT JOIN pg_catalog.pg_namespace n ON n.nspname = t.table_schema
                LEFT JOIN pg_catalog.pg_class c ON c.relname = t.table_name AND c.relnamespace = n.oid
                WHERE t.table_schema = $1
                ORDER BY t.table_name
                "#,
                &[&schema],
            )
            .await
            .map_err(Self::query_error)?;

        Ok(rows
            .iter()
            .map(|row| {
                let mut table = SchemaTable::new(
                    row.get::<_, String>(0),
                    Some(schema.to_string()),
                    TableType::from_catalog(&row.get::<_, String>(1)),
                );
                // reltuples is -1 until the table has been analyzed
                table.row_count = row.get::<_, Option<i64>>(2).filter(|n| *n >= 0);
                table.size_bytes = row.get::<_, Option<i64>>(3);
                table
            })
            .collect())
    }

    async fn get_table_schema(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<SchemaColumn>, AppError> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT
                    c.column_name::text,
                    c.data_type::text,
                    c.is_nullable::text,
                    c.column_default::text,
                    (pk.column_name IS NOT NULL) AS is_primary_key,
                    (fk.column_name IS NOT NULL) AS is_foreign_key,
                    col_description(format('%I.%I', c.table_schema, c.table_name)::regclass, c.ordinal_position::int) AS comment
                FROM information_schema.columns c
                LEFT JOIN (
                    SELECT DISTINCT ku.column_name
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage ku
                        ON tc.constraint_name = ku.constraint_name
                        AND tc.table_schema = ku.table_schema
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                        AND tc.table_schema = $1
                        AND tc.table_name = $2
                ) pk ON c.column_name = pk.column_name
                LEFT JOIN (
                    SELECT DISTINCT ku.column_name
                    FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage ku
                        ON tc.constraint_name = ku.constraint_name
                        AND tc.table_schema = ku.table_schema
                    WHERE tc.constraint_type = 'FOREIGN KEY'
                        AND tc.table_schema = $1
                        AND tc.table_name = $2
                ) fk ON c.column_name = fk.column_name
                WHERE c.table_schema = $1 AND c.table_name = $2
                ORDER BY c.ordinal_position
                "#,
                &[&schema, &table],
            )
            .await
            .map_err(Self::query_error)?;

        Ok(rows
            .iter()
            .map(|row| SchemaColumn {
                name: row.get(0),
                data_type: row.get(1),
                nullable: row.get::<_, String>(2) == "YES",
                default_value: row.get::<_, Option<String>>(3),
                is_primary_key: row.try_get(4).unwrap_or(false),
                is_foreign_key: row.try_get(5).unwrap_or(false),
                comment: row.get::<_, Option<String>>(6),
            })
            .collect())
    }

    async fn execute_query(&self, text: &str) -> Result<QueryResult, AppError> {
        let client = self.client().await?;

        let start_time = Instant::now();
        // Prepare first so the column list is known even for empty results
        let statement = client.prepare(text).await.map_err(Self::query_error)?;
        let rows = client.query(&statement, &[]).await.map_err(Self::query_error)?;
        let duration = start_time.elapsed().as_millis() as u64;

        let columns = unique_column_names(statement.columns().iter().map(|c| c.name()));

        let data: Vec<Row> = rows
            .iter()
            .map(|row| {
                let mut row_obj = Row::with_capacity(columns.len());
                for (idx, column) in row.columns().iter().enumerate() {
                    row_obj.insert(columns[idx].clone(), pg_value_to_json(row, idx, column.type_()));
                }
                row_obj
            })
            .collect();

        Ok(QueryResult::new(columns, data, duration))
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.status.snapshot()
    }

    fn preview_query(&self, table: &str, schema: Option<&str>, limit: usize) -> String {
        format!(
            "SELECT * FROM \"{}\".\"{}\" LIMIT {}",
            schema.unwrap_or(DEFAULT_SCHEMA),
            table,
            limit
        )
    }
}

/// Convert one Postgres cell to JSON by column type
fn pg_value_to_json(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    fn typed<'a, T>(row: &'a tokio_postgres::Row, idx: usize, f: impl Fn(T) -> Value) -> Option<Value>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(idx)
            .ok()
            .map(|v| v.map(f).unwrap_or(Value::Null))
    }

    let value = match *ty {
        Type::INT2 => typed::<i16>(row, idx, |v| json!(v)),
        Type::INT4 => typed::<i32>(row, idx, |v| json!(v)),
        Type::INT8 => typed::<i64>(row, idx, |v| json!(v)),
        Type::OID => typed::<u32>(row, idx, |v| json!(v)),
        Type::FLOAT4 => typed::<f32>(row, idx, |v| json!(v)),
        Type::FLOAT8 => typed::<f64>(row, idx, |v| json!(v)),
        Type::NUMERIC => typed::<Decimal>(row, idx, |v| json!(v.to_string())),
        Type::BOOL => typed::<bool>(row, idx, |v| json!(v)),
        Type::JSON | Type::JSONB => typed::<Value>(row, idx, |v| v),
        Type::UUID => typed::<uuid::Uuid>(row, idx, |v| json!(v.to_string())),
        Type::TIMESTAMP => typed::<chrono::NaiveDateTime>(row, idx, |v| json!(v.to_string())),
        Type::TIMESTAMPTZ => typed::<chrono::DateTime<chrono::Utc>>(row, idx, |v| json!(v.to_rfc3339())),
        Type::DATE => typed::<chrono::NaiveDate>(row, idx, |v| json!(v.to_string())),
        Type::TIME => typed::<chrono::NaiveTime>(row, idx, |v| json!(v.to_string())),
        Type::BYTEA => typed::<Vec<u8>>(row, idx, |v| json!(format!("\\x{}", hex::encode(v)))),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => typed::<Vec<Option<String>>>(row, idx, |v| json!(v)),
        Type::INT4_ARRAY => typed::<Vec<Option<i32>>>(row, idx, |v| json!(v)),
        Type::INT8_ARRAY => typed::<Vec<Option<i64>>>(row, idx, |v| json!(v)),
        _ => None,
    };

    value.unwrap_or_else(|| match row.try_get::<_, Option<String>>(idx) {
        Ok(Some(v)) => json!(v),
        Ok(None) => Value::Null,
        // Types without a text mapping are shown by name
        Err(_) => json!(format!("<{}>", ty.name())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> DataSourceConfig {
        DataSourceConfig::new("Warehouse", "postgresql", "db.internal", 5432, "analytics")
            .with_credentials("reader", "secret")
            .with_option("application_name", json!("gateway"))
    }

    #[test]
    fn test_pool_config_from_source() {
        let settings = PoolSettings {
            max_size: 7,
            acquire_timeout: Duration::from_secs(3),
            ..PoolSettings::default()
        };
        let adapter = PostgreSQLAdapter::new(&config(), settings).unwrap();
        let cfg = adapter.pool_config();

        assert_eq!(cfg.host.as_deref(), Some("db.internal"));
        assert_eq!(cfg.dbname.as_deref(), Some("analytics"));
        assert_eq!(cfg.application_name.as_deref(), Some("gateway"));
        assert!(matches!(cfg.ssl_mode, Some(SslMode::Disable)));

        let pool = cfg.pool.unwrap();
        assert_eq!(pool.max_size, 7);
        assert_eq!(pool.timeouts.wait, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_ssl_mode_required_when_enabled() {
        let mut source = config();
        source.ssl = true;
        let adapter = PostgreSQLAdapter::new(&source, PoolSettings::default()).unwrap();
        assert!(matches!(adapter.pool_config().ssl_mode, Some(SslMode::Require)));
    }

    #[test]
    fn test_preview_query_defaults_to_public() {
        let adapter = PostgreSQLAdapter::new(&config(), PoolSettings::default()).unwrap();
        assert_eq!(
            adapter.preview_query("orders", None, 50),
            "SELECT * FROM \"public\".\"orders\" LIMIT 50"
        );
        assert_eq!(
            adapter.preview_query("orders", Some("sales"), 10),
            "SELECT * FROM \"sales\".\"orders\" LIMIT 10"
        );
    }

    #[tokio::test]
    async fn test_io_requires_connect() {
        let adapter = PostgreSQLAdapter::new(&config(), PoolSettings::default()).unwrap();
        assert!(matches!(adapter.get_schemas().await, Err(AppError::Connection(_))));
        assert!(matches!(adapter.execute_query("SELECT 1").await, Err(AppError::Connection(_))));
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let adapter = PostgreSQLAdapter::new(&config(), PoolSettings::default()).unwrap();
        assert!(adapter.disconnect().await.is_ok());
        assert!(!adapter.connection_status().connected);
    }
}
