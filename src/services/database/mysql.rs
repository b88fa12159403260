// MySQL adapter using connection pooling for optimal resource management
use crate::api::middleware::AppError;
use crate::models::{
    unique_column_names, ConnectionStatus, DataSourceConfig, DataSourceType, QueryResult, Row,
    SchemaColumn, SchemaTable, TableType,
};
use crate::services::database::adapter::{not_connected, DatabaseAdapter, StatusTracker};
use crate::services::database::{validate_config, PoolSettings};
use mysql_async::consts::ColumnType;
use mysql_async::{prelude::*, Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, SslOpts, Value as MySqlValue};
use serde_json::{json, Value};
use std::time::Instant;
use tokio::sync::RwLock;

pub struct MySQLAdapter {
    config: DataSourceConfig,
    settings: PoolSettings,
    pool: RwLock<Option<Pool>>,
    status: StatusTracker,
}

impl MySQLAdapter {
    pub fn new(config: &DataSourceConfig, settings: PoolSettings) -> Result<Self, AppError> {
        validate_config(config)?;
        // Reject impossible pool bounds before any connect attempt
        Self::pool_constraints(&settings)?;

        Ok(Self {
            config: config.clone(),
            settings,
            pool: RwLock::new(None),
            status: StatusTracker::default(),
        })
    }

    fn pool_constraints(settings: &PoolSettings) -> Result<PoolConstraints, AppError> {
        PoolConstraints::new(settings.min_idle, settings.max_size).ok_or_else(|| {
            AppError::Configuration(format!(
                "Invalid MySQL pool bounds: min {} max {}",
                settings.min_idle, settings.max_size
            ))
        })
    }

    fn opts(&self) -> Result<Opts, AppError> {
        let pool_opts = PoolOpts::default()
            .with_constraints(Self::pool_constraints(&self.settings)?)
            .with_inactive_connection_ttl(self.settings.idle_timeout);

        let builder = OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.config.port)
            .db_name(Some(self.config.database.clone()))
            .user(self.config.username.clone())
            .pass(self.config.password.clone())
            .ssl_opts(if self.config.ssl { Some(SslOpts::default()) } else { None })
            .pool_opts(pool_opts);

        Ok(Opts::from(builder))
    }

    async fn acquire(pool: &Pool, timeout: std::time::Duration) -> Result<Conn, AppError> {
        tokio::time::timeout(timeout, pool.get_conn())
            .await
            .map_err(|_| AppError::Connection(format!("Timed out acquiring MySQL connection after {:?}", timeout)))?
            .map_err(|e| AppError::Connection(format!("Failed to get MySQL connection from pool: {}", e)))
    }

    /// Get a pooled connection, failing when the adapter is not connected
    async fn get_conn(&self) -> Result<Conn, AppError> {
        let pool = self
            .pool
            .read()
            .await
            .clone()
            .ok_or_else(|| not_connected(&self.config))?;

        Self::acquire(&pool, self.settings.acquire_timeout).await
    }

    fn query_error(e: mysql_async::Error) -> AppError {
        match e {
            mysql_async::Error::Server(server) => AppError::Execution(server.message),
            other => AppError::Execution(other.to_string()),
        }
    }

    fn namespace<'a>(&'a self, schema: Option<&'a str>) -> &'a str {
        schema.unwrap_or(&self.config.database)
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for MySQLAdapter {
    fn engine(&self) -> DataSourceType {
        DataSourceType::MySQL
    }

    async fn connect(&self) -> Result<(), AppError> {
        if self.pool.read().await.is_some() {
            return Ok(());
        }

        let mut slot = self.pool.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let pool = Pool::new(self.opts()?);
        let checked = match Self::acquire(&pool, self.settings.connect_timeout).await {
            Ok(mut conn) => conn.ping().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match checked {
            Ok(()) => {
                *slot = Some(pool);
                self.status.mark_connected();
                tracing::info!("Connected to MySQL: {}", self.config.redacted_url());
                Ok(())
            }
            Err(message) => {
                if let Err(e) = pool.disconnect().await {
                    tracing::debug!("Discarding failed MySQL pool: {}", e);
                }
                self.status.record_failure(message.clone());
                tracing::error!("MySQL connection failed for {}: {}", self.config.redacted_url(), message);
                Err(AppError::Connection(message))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), AppError> {
        let pool = self.pool.write().await.take();
        self.status.mark_disconnected();

        if let Some(pool) = pool {
            pool.disconnect()
                .await
                .map_err(|e| AppError::Connection(format!("Failed to close MySQL pool: {}", e)))?;
            tracing::info!("Disconnected from MySQL: {}", self.config.redacted_url());
        }
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        if self.connect().await.is_err() {
            return false;
        }

        let result = match self.get_conn().await {
            Ok(mut conn) => conn.ping().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(()) => true,
            Err(message) => {
                self.status.record_failure(message);
                false
            }
        }
    }

    async fn get_schemas(&self) -> Result<Vec<String>, AppError> {
        let mut conn = self.get_conn().await?;
        conn.query(
            "SELECT SCHEMA_NAME FROM information_schema.SCHEMATA \
             WHERE SCHEMA_NAME NOT IN ('information_schema', 'mysql', 'performance_schema', 'sys') \
             ORDER BY SCHEMA_NAME",
        )
        .await
        .map_err(Self::query_error)
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<SchemaTable>, AppError> {
        let schema = self.namespace(schema);
        let mut conn = self.get_conn().await?;

        let rows: Vec<(String, String, Option<u64>, Option<u64>)> = conn
            .exec(
                r#"
                SELECT
                    TABLE_NAME,
                    TABLE_TYPE,
                    TABLE_ROWS,
                    DATA_LENGTH + INDEX_LENGTH
                FROM information_schema.TABLES
                WHERE TABLE_SCHEMA = ?
                ORDER BY TABLE_NAME
                "#,
                (schema,),
            )
            .await
            .map_err(Self::query_error)?;

        Ok(rows
            .into_iter()
            .map(|(name, table_type, row_count, size_bytes)| {
                let mut table = SchemaTable::new(name, Some(schema.to_string()), TableType::from_catalog(&table_type));
                table.row_count = row_count.map(|v| v as i64);
                table.size_bytes = size_bytes.map(|v| v as i64);
                table
            })
            .collect())
    }

    async fn get_table_schema(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<SchemaColumn>, AppError> {
        let schema = self.namespace(schema);
        let mut conn = self.get_conn().await?;

        let query = r#"
            SELECT
                c.COLUMN_NAME,
                c.COLUMN_TYPE,
                c.IS_NULLABLE,
                c.COLUMN_DEFAULT,
                CASE WHEN c.COLUMN_KEY = 'PRI' THEN 1 ELSE 0 END AS is_primary_key,
                CASE WHEN EXISTS (
                    SELECT 1 FROM information_schema.KEY_COLUMN_USAGE k
                    WHERE k.TABLE_SCHEMA = c.TABLE_SCHEMA
                      AND k.TABLE_NAME = c.TABLE_NAME
                      AND k.COLUMN_NAME = c.COLUMN_NAME
                      AND k.REFERENCED_TABLE_NAME IS NOT NULL
                ) THEN 1 ELSE 0 END AS is_foreign_key,
                c.COLUMN_COMMENT
            FROM information_schema.COLUMNS c
            WHERE c.TABLE_SCHEMA = ? AND c.TABLE_NAME = ?
            ORDER BY c.ORDINAL_POSITION
        "#;

        let rows: Vec<(String, String, String, Option<String>, i64, i64, Option<String>)> = conn
            .exec(query, (schema, table))
            .await
            .map_err(Self::query_error)?;

        Ok(rows
            .into_iter()
            .map(|(name, data_type, is_nullable, default_value, is_pk, is_fk, comment)| SchemaColumn {
                name,
                data_type,
                nullable: is_nullable == "YES",
                default_value,
                is_primary_key: is_pk == 1,
                is_foreign_key: is_fk == 1,
                comment: comment.filter(|c| !c.is_empty()),
            })
            .collect())
    }

    async fn execute_query(&self, text: &str) -> Result<QueryResult, AppError> {
        let mut conn = self.get_conn().await?;

        let start_time = Instant::now();
        let (column_meta, rows) = match run_prepared(&mut conn, text).await {
            Err(e) if is_unsupported_by_prepare(&e) => {
                tracing::debug!("MySQL cannot prepare this statement, using the text protocol");
                run_text(&mut conn, text).await
            }
            other => other,
        }
        .map_err(Self::query_error)?;
        let duration = start_time.elapsed().as_millis() as u64;

        let columns = unique_column_names(column_meta.iter().map(|(name, _)| name.clone()));

        let data: Vec<Row> = rows
            .into_iter()
            .map(|row| {
                let mut row_obj = Row::with_capacity(columns.len());
                for (idx, value) in row.unwrap_raw().into_iter().enumerate() {
                    let value = value.unwrap_or(MySqlValue::NULL);
                    if let (Some(name), Some((_, column_type))) = (columns.get(idx), column_meta.get(idx)) {
                        row_obj.insert(name.clone(), mysql_value_to_json(value, *column_type));
                    }
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
        format!("SELECT * FROM `{}`.`{}` LIMIT {}", self.namespace(schema), table, limit)
    }
}

/// Server error for statement kinds the prepared-statement protocol rejects
const ER_UNSUPPORTED_PS: u16 = 1295;

type FetchedRows = (Vec<(String, ColumnType)>, Vec<mysql_async::Row>);

/// The connection negotiates multi-statement support, so user text goes
/// through the prepared-statement protocol, which accepts exactly one statement
async fn run_prepared(conn: &mut Conn, text: &str) -> mysql_async::Result<FetchedRows> {
    let mut result = conn.exec_iter(text, ()).await?;
    let column_meta = column_meta(result.columns_ref());
    let rows = result.collect_and_drop().await?;
    Ok((column_meta, rows))
}

async fn run_text(conn: &mut Conn, text: &str) -> mysql_async::Result<FetchedRows> {
    let mut result = conn.query_iter(text).await?;
    let column_meta = column_meta(result.columns_ref());
    let rows = result.collect_and_drop().await?;
    Ok((column_meta, rows))
}

fn column_meta(columns: &[mysql_async::Column]) -> Vec<(String, ColumnType)> {
    columns
        .iter()
        .map(|c| (c.name_str().into_owned(), c.column_type()))
        .collect()
}

fn is_unsupported_by_prepare(e: &mysql_async::Error) -> bool {
    matches!(e, mysql_async::Error::Server(server) if server.code == ER_UNSUPPORTED_PS)
}

/// Convert a MySQL value to JSON.
///
/// The text protocol (and the binary one for strings and decimals) delivers
/// values as bytes, so the column type decides whether they are parsed back
/// into numbers or JSON.
fn mysql_value_to_json(value: MySqlValue, column_type: ColumnType) -> Value {
    match value {
        MySqlValue::NULL => Value::Null,
        MySqlValue::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => text_to_json(s, column_type),
            Err(e) => json!(format!("0x{}", hex::encode(e.into_bytes()))),
        },
        MySqlValue::Int(i) => json!(i),
        MySqlValue::UInt(u) => json!(u),
        MySqlValue::Float(f) => json!(f),
        MySqlValue::Double(d) => json!(d),
        MySqlValue::Date(y, m, d, h, min, s, micros) => {
            if h == 0 && min == 0 && s == 0 && micros == 0 && column_type == ColumnType::MYSQL_TYPE_DATE {
                json!(format!("{:04}-{:02}-{:02}", y, m, d))
            } else {
                json!(format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, m, d, h, min, s))
            }
        }
        MySqlValue::Time(is_neg, d, h, m, s, _) => {
            let sign = if is_neg { "-" } else { "" };
            let total_hours = d * 24 + h as u32;
            json!(format!("{}{}:{:02}:{:02}", sign, total_hours, m, s))
        }
    }
}

fn text_to_json(text: String, column_type: ColumnType) -> Value {
    match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => {
            if let Ok(i) = text.parse::<i64>() {
                json!(i)
            } else if let Ok(u) = text.parse::<u64>() {
                json!(u)
            } else {
                json!(text)
            }
        }
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => {
            text.parse::<f64>().map(|f| json!(f)).unwrap_or_else(|_| json!(text))
        }
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_str(&text).unwrap_or_else(|_| json!(text)),
        // DECIMAL stays textual to keep precision
        _ => json!(text),
    }
}
