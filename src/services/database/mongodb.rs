//! MongoDB adapter.
//!
//! Databases play the role of schemas and collections the role of tables.
//! Collections carry no declared schema, so `get_table_schema` samples
//! documents and infers one. Queries use the shell-style shorthand:
//!
//! ```text
//! db.orders.find({"status": "paid"}).limit(10)
//! db.orders.aggregate([{"$group": {"_id": "$status", "n": {"$sum": 1}}}])
//! db.getSiblingDB("archive").orders.find({})
//! ```

use crate::api::middleware::AppError;
use crate::models::{
    ConnectionStatus, DataSourceConfig, DataSourceType, QueryResult, Row, SchemaColumn,
    SchemaTable, TableType,
};
use crate::services::database::adapter::{not_connected, DatabaseAdapter, StatusTracker};
use crate::services::database::{option_str, validate_config, PoolSettings};
use crate::validation::QueryViolation;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::options::{ClientOptions, Credential, Tls, TlsOptions};
use mongodb::Client;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

const SYSTEM_DATABASES: [&str; 3] = ["admin", "local", "config"];
const WRITE_STAGES: [&str; 2] = ["$out", "$merge"];

static SHORTHAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)^\s*db\.(?:getSiblingDB\(\s*["'](\w+)["']\s*\)\.)?(\w+)\.(find|aggregate)\((.*?)\)(?:\.limit\((\d+)\))?\s*;?\s*$"#,
    )
        .expect("shorthand pattern is valid")
});

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOperation {
    Find { filter: Document },
    Aggregate { pipeline: Vec<Document> },
}

/// Parsed form of the document query shorthand
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentQuery {
    /// Set by `db.getSiblingDB("<name>")`, otherwise the configured database
    pub database: Option<String>,
    pub collection: String,
    pub operation: DocumentOperation,
    pub limit: Option<i64>,
}

/// Parse `db.<collection>.find(...)` / `db.<collection>.aggregate([...])`,
/// optionally addressed through `db.getSiblingDB("<database>")`.
///
/// Arguments are MongoDB extended JSON. Aggregations that write (`$out`,
/// `$merge`) are rejected.
pub fn parse_document_query(text: &str) -> Result<DocumentQuery, QueryViolation> {
    let unsupported = |reason: &str| QueryViolation::UnsupportedDocumentQuery(reason.to_string());

    let captures = SHORTHAND.captures(text).ok_or_else(|| {
        unsupported("expected db.<collection>.find(<filter>) or db.<collection>.aggregate(<pipeline>)")
    })?;

    let database = captures.get(1).map(|m| m.as_str().to_string());
    let collection = captures[2].to_string();
    let args = captures[4].trim();
    let limit = match captures.get(5) {
        Some(m) => Some(
            m.as_str()
                .parse::<i64>()
                .map_err(|_| unsupported("limit is out of range"))?,
        ),
        None => None,
    };

    let operation = match &captures[3] {
        "find" => {
            let filter = if args.is_empty() {
                Document::new()
            } else {
                match parse_extended_json(args)? {
                    Bson::Document(filter) => filter,
                    _ => return Err(unsupported("find filter must be a JSON object")),
                }
            };
            DocumentOperation::Find { filter }
        }
        _ => {
            let stages = match parse_extended_json(args)? {
                Bson::Array(stages) => stages,
                _ => return Err(unsupported("aggregate pipeline must be a JSON array")),
            };

            let mut pipeline = Vec::with_capacity(stages.len());
            for stage in stages {
                let Bson::Document(stage) = stage else {
                    return Err(unsupported("pipeline stages must be JSON objects"));
                };
                if let Some(write) = WRITE_STAGES.iter().find(|s| stage.contains_key(**s)) {
                    return Err(QueryViolation::UnsupportedDocumentQuery(format!(
                        "{} stage is not allowed",
                        write
                    )));
                }
                pipeline.push(stage);
            }
            DocumentOperation::Aggregate { pipeline }
        }
    };

    Ok(DocumentQuery {
        database,
        collection,
        operation,
        limit,
    })
}

fn parse_extended_json(args: &str) -> Result<Bson, QueryViolation> {
    let value: Value = serde_json::from_str(args)
        .map_err(|e| QueryViolation::UnsupportedDocumentQuery(format!("invalid JSON argument: {}", e)))?;
    Bson::try_from(value)
        .map_err(|e| QueryViolation::UnsupportedDocumentQuery(format!("invalid extended JSON: {}", e)))
}

fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        Bson::Boolean(_) => "bool",
        Bson::Null | Bson::Undefined => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::JavaScriptCode(_) | Bson::JavaScriptCodeWithScope(_) => "javascript",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::Timestamp(_) => "timestamp",
        Bson::Binary(_) => "binData",
        Bson::ObjectId(_) => "objectId",
        Bson::DateTime(_) => "date",
        Bson::Symbol(_) => "symbol",
        Bson::Decimal128(_) => "decimal",
        Bson::MaxKey => "maxKey",
        Bson::MinKey => "minKey",
        Bson::DbPointer(_) => "dbPointer",
    }
}

/// Infer top-level fields from sampled documents.
///
/// Fields keep first-seen order. A field missing from any sample, or null in
/// any sample, is nullable. Type names are the sorted set of non-null BSON
/// types observed.
pub fn infer_columns(samples: &[Document]) -> Vec<SchemaColumn> {
    struct Observed {
        types: BTreeSet<&'static str>,
        present: usize,
        saw_null: bool,
    }

    let mut order: Vec<String> = Vec::new();
    let mut fields: HashMap<String, Observed> = HashMap::new();

    for document in samples {
        for (key, value) in document {
            let observed = fields.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                Observed {
                    types: BTreeSet::new(),
                    present: 0,
                    saw_null: false,
                }
            });
            observed.present += 1;
            match bson_type_name(value) {
                "null" => observed.saw_null = true,
                name => {
                    observed.types.insert(name);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|name| {
            let observed = fields.remove(&name)?;
            let data_type = if observed.types.is_empty() {
                "null".to_string()
            } else {
                observed.types.into_iter().collect::<Vec<_>>().join(" | ")
            };
            let is_id = name == "_id";
            Some(SchemaColumn {
                nullable: !is_id && (observed.saw_null || observed.present < samples.len()),
                is_primary_key: is_id,
                is_foreign_key: false,
                default_value: None,
                comment: None,
                data_type,
                name,
            })
        })
        .collect()
}

/// Turn documents into rows plus the union of their keys in first-seen order
fn documents_to_rows(documents: Vec<Document>) -> (Vec<String>, Vec<Row>) {
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::with_capacity(documents.len());

    for document in documents {
        for key in document.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
        match Bson::Document(document).into_relaxed_extjson() {
            Value::Object(row) => rows.push(row),
            _ => rows.push(Row::new()),
        }
    }

    (columns, rows)
}

fn numeric(value: Option<&Bson>) -> Option<i64> {
    match value? {
        Bson::Int32(v) => Some(*v as i64),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) => Some(*v as i64),
        _ => None,
    }
}

pub struct MongoDBAdapter {
    config: DataSourceConfig,
    settings: PoolSettings,
    client: RwLock<Option<Client>>,
    status: StatusTracker,
}

impl MongoDBAdapter {
    pub fn new(config: &DataSourceConfig, settings: PoolSettings) -> Result<Self, AppError> {
        validate_config(config)?;

        Ok(Self {
            config: config.clone(),
            settings,
            client: RwLock::new(None),
            status: StatusTracker::default(),
        })
    }

    async fn client_options(&self) -> Result<ClientOptions, AppError> {
        let uri = format!("mongodb://{}:{}/", self.config.host, self.config.port);
        let mut options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| AppError::Configuration(format!("Invalid MongoDB address: {}", e)))?;

        if let Some(username) = &self.config.username {
            let source = option_str(&self.config, "auth_source")
                .unwrap_or("admin")
                .to_string();
            options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(self.config.password.clone())
                    .source(source)
                    .build(),
            );
        }

        if self.config.ssl {
            options.tls = Some(Tls::Enabled(TlsOptions::default()));
        }

        options.app_name = option_str(&self.config, "app_name").map(str::to_string);
        options.repl_set_name = option_str(&self.config, "replica_set").map(str::to_string);
        options.max_pool_size = Some(self.settings.max_size as u32);
        options.min_pool_size = Some(self.settings.min_idle as u32);
        options.max_idle_time = Some(self.settings.idle_timeout);
        options.connect_timeout = Some(self.settings.connect_timeout);
        options.server_selection_timeout = Some(self.settings.acquire_timeout);
        options.default_database = Some(self.config.database.clone());

        Ok(options)
    }

    async fn client(&self) -> Result<Client, AppError> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| not_connected(&self.config))
    }

    async fn ping(client: &Client) -> Result<(), mongodb::error::Error> {
        client.database("admin").run_command(doc! { "ping": 1 }).await.map(|_| ())
    }

    fn database_name<'a>(&'a self, schema: Option<&'a str>) -> &'a str {
        schema.unwrap_or(&self.config.database)
    }

    fn query_error(e: mongodb::error::Error) -> AppError {
        AppError::Execution(e.to_string())
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for MongoDBAdapter {
    fn engine(&self) -> DataSourceType {
        DataSourceType::MongoDB
    }

    async fn connect(&self) -> Result<(), AppError> {
        if self.client.read().await.is_some() {
            return Ok(());
        }

        let mut slot = self.client.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let options = self.client_options().await?;
        let client = Client::with_options(options)
            .map_err(|e| AppError::Configuration(format!("Failed to create MongoDB client: {}", e)))?;

        match Self::ping(&client).await {
            Ok(()) => {
                *slot = Some(client);
                self.status.mark_connected();
                info!("Connected to MongoDB: {}", self.config.redacted_url());
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                client.shutdown().await;
                self.status.record_failure(message.clone());
                error!("MongoDB connection failed for {}: {}", self.config.redacted_url(), message);
                Err(AppError::Connection(message))
            }
        }
    }

    async fn disconnect(&self) -> Result<(), AppError> {
        let client = self.client.write().await.take();
        self.status.mark_disconnected();

        if let Some(client) = client {
            client.shutdown().await;
            info!("Disconnected from MongoDB: {}", self.config.redacted_url());
        }
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        if self.connect().await.is_err() {
            return false;
        }

        let result = match self.client().await {
            Ok(client) => Self::ping(&client).await.map_err(|e| e.to_string()),
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
        let client = self.client().await?;
        let mut names = client.list_database_names().await.map_err(Self::query_error)?;
        names.retain(|name| !SYSTEM_DATABASES.contains(&name.as_str()));
        names.sort();
        Ok(names)
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<SchemaTable>, AppError> {
        let db_name = self.database_name(schema);
        let db = self.client().await?.database(db_name);

        let mut names = db.list_collection_names().await.map_err(Self::query_error)?;
        names.sort();

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let mut table = SchemaTable::new(name.clone(), Some(db_name.to_string()), TableType::Collection);

            // Statistics are best-effort; views and restricted users cannot run collStats
            match db.run_command(doc! { "collStats": name.as_str() }).await {
                Ok(stats) => {
                    table.row_count = numeric(stats.get("count"));
                    table.size_bytes = numeric(stats.get("size"));
                }
                Err(e) => debug!("collStats unavailable for {}.{}: {}", db_name, name, e),
            }
            tables.push(table);
        }

        Ok(tables)
    }

    async fn get_table_schema(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<SchemaColumn>, AppError> {
        let collection = self
            .client()
            .await?
            .database(self.database_name(schema))
            .collection::<Document>(table);

        let samples: Vec<Document> = collection
            .find(doc! {})
            .limit(self.settings.sample_size as i64)
            .await
            .map_err(Self::query_error)?
            .try_collect()
            .await
            .map_err(Self::query_error)?;

        debug!("Inferred schema for {} from {} sampled documents", table, samples.len());
        Ok(infer_columns(&samples))
    }

    async fn execute_query(&self, text: &str) -> Result<QueryResult, AppError> {
        let query = parse_document_query(text)?;
        let client = self.client().await?;
        let collection = client
            .database(self.database_name(query.database.as_deref()))
            .collection::<Document>(&query.collection);

        let start_time = Instant::now();
        let documents: Vec<Document> = match query.operation {
            DocumentOperation::Find { filter } => {
                let mut find = collection.find(filter);
                if let Some(limit) = query.limit {
                    find = find.limit(limit);
                }
                find.await
                    .map_err(Self::query_error)?
                    .try_collect()
                    .await
                    .map_err(Self::query_error)?
            }
            DocumentOperation::Aggregate { mut pipeline } => {
                if let Some(limit) = query.limit {
                    pipeline.push(doc! { "$limit": limit });
                }
                collection
                    .aggregate(pipeline)
                    .await
                    .map_err(Self::query_error)?
                    .try_collect()
                    .await
                    .map_err(Self::query_error)?
            }
        };
        let duration = start_time.elapsed().as_millis() as u64;

        let (columns, rows) = documents_to_rows(documents);
        Ok(QueryResult::new(columns, rows, duration))
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.status.snapshot()
    }

    fn preview_query(&self, table: &str, schema: Option<&str>, limit: usize) -> String {
        match schema.filter(|name| *name != self.config.database) {
            Some(database) => format!(
                "db.getSiblingDB(\"{}\").{}.find({{}}).limit({})",
                database, table, limit
            ),
            None => format!("db.{}.find({{}}).limit({})", table, limit),
        }
    }
}
