use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::api::middleware::AppError;

/// Engine kinds a data source can point at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceType {
    PostgreSQL,
    MySQL,
    MongoDB,
}

impl DataSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceType::PostgreSQL => "postgresql",
            DataSourceType::MySQL => "mysql",
            DataSourceType::MongoDB => "mongodb",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DataSourceType::PostgreSQL => "PostgreSQL",
            DataSourceType::MySQL => "MySQL",
            DataSourceType::MongoDB => "MongoDB",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DataSourceType::PostgreSQL => 5432,
            DataSourceType::MySQL => 3306,
            DataSourceType::MongoDB => 27017,
        }
    }

    /// Document stores take the shorthand query syntax instead of SQL
    pub fn is_document_store(&self) -> bool {
        matches!(self, DataSourceType::MongoDB)
    }
}

impl FromStr for DataSourceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DataSourceType::PostgreSQL),
            "mysql" | "mariadb" => Ok(DataSourceType::MySQL),
            "mongodb" | "mongo" => Ok(DataSourceType::MongoDB),
            _ => Err(AppError::Configuration(format!(
                "Unsupported data source type: {}. Supported types: postgresql, mysql, mongodb",
                s
            ))),
        }
    }
}

impl fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered data source as owned by the config store.
///
/// `source_type` stays a plain string: the store accepts whatever the admin
/// typed, and an unknown engine only fails once an adapter is built for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub connection_options: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataSourceConfig {
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            source_type: source_type.into(),
            host: host.into(),
            port,
            database: database.into(),
            username: None,
            password: None,
            ssl: false,
            connection_options: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.connection_options.insert(key.into(), value);
        self
    }

    /// Parse the declared engine kind
    pub fn engine(&self) -> Result<DataSourceType, AppError> {
        self.source_type.parse()
    }

    /// Connection URL with the password removed, for log lines
    pub fn redacted_url(&self) -> String {
        let scheme = self
            .engine()
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|_| self.source_type.to_lowercase());

        let raw = format!("{}://{}:{}/{}", scheme, self.host, self.port, self.database);
        match url::Url::parse(&raw) {
            Ok(mut parsed) => {
                if let Some(username) = &self.username {
                    let _ = parsed.set_username(username);
                }
                parsed.to_string()
            }
            Err(_) => "[invalid-url]".to_string(),
        }
    }
}

/// Create/update payload for a data source
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub connection_options: HashMap<String, Value>,
}

impl DataSourceRequest {
    /// Validate the payload and turn it into a config record
    pub fn into_config(self, id: Option<String>) -> Result<DataSourceConfig, AppError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation("Data source name cannot be empty".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(AppError::Validation("Host cannot be empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(AppError::Validation("Database cannot be empty".to_string()));
        }

        let engine: DataSourceType = self.source_type.parse()?;
        let port = self.port.unwrap_or_else(|| engine.default_port());

        let mut config = DataSourceConfig::new(name, engine.as_str(), self.host.trim(), port, self.database.trim());
        if let Some(id) = id {
            config.id = id;
        }
        config.username = self.username.filter(|u| !u.is_empty());
        config.password = self.password;
        config.ssl = self.ssl;
        config.connection_options = self.connection_options;
        Ok(config)
    }
}

/// Normalized digest of the connection-relevant fields of a config.
///
/// Cosmetic fields (name, timestamps) are excluded so renaming a data source
/// keeps its live adapter. Option maps are sorted before hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigSignature(String);

impl ConfigSignature {
    pub fn of(config: &DataSourceConfig) -> Self {
        let engine = config
            .engine()
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|_| config.source_type.trim().to_lowercase());

        let options: BTreeMap<&String, Value> = config
            .connection_options
            .iter()
            .map(|(key, value)| (key, canonical_value(value)))
            .collect();
        let password_fingerprint = config
            .password
            .as_ref()
            .map(|p| hex::encode(Sha256::digest(p.as_bytes())));

        // Top-level keys are fixed; nested objects were re-keyed in sorted order
        let canonical = serde_json::json!({
            "type": engine,
            "host": config.host,
            "port": config.port,
            "database": config.database,
            "username": config.username,
            "password": password_fingerprint,
            "ssl": config.ssl,
            "options": options,
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        ConfigSignature(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Rebuild every nested object with its keys inserted in sorted order, so the
/// serialization does not depend on how `serde_json::Map` orders entries.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, inner)| (key.clone(), canonical_value(inner)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

impl fmt::Display for ConfigSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last known connection state of an adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> DataSourceConfig {
        DataSourceConfig::new("Analytics", "postgresql", "db", 5432, "app")
            .with_credentials("reader", "secret")
            .with_option("application_name", json!("dashboard"))
            .with_option("max_pool_size", json!(5))
    }

    #[test]
    fn test_type_parsing() {
        assert_eq!("postgres".parse::<DataSourceType>().unwrap(), DataSourceType::PostgreSQL);
        assert_eq!("MySQL".parse::<DataSourceType>().unwrap(), DataSourceType::MySQL);
        assert_eq!("mongodb".parse::<DataSourceType>().unwrap(), DataSourceType::MongoDB);
        assert!(matches!(
            "redis".parse::<DataSourceType>(),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn test_signature_ignores_cosmetic_fields() {
        let a = sample();
        let mut b = a.clone();
        b.name = "Renamed".to_string();
        b.id = "other-id".to_string();
        b.updated_at = Utc::now();

        assert_eq!(ConfigSignature::of(&a), ConfigSignature::of(&b));
    }

    #[test]
    fn test_signature_is_order_independent() {
        let a = DataSourceConfig::new("x", "mysql", "h", 3306, "d")
            .with_option("a", json!(1))
            .with_option("b", json!({"y": 2, "x": 1}));

        let mut b = a.clone();
        b.connection_options = HashMap::new();
        b.connection_options.insert("b".to_string(), json!({"x": 1, "y": 2}));
        b.connection_options.insert("a".to_string(), json!(1));

        assert_eq!(ConfigSignature::of(&a), ConfigSignature::of(&b));
    }

    #[test]
    fn test_signature_ignores_nested_option_key_order() {
        let a = DataSourceConfig::new("x", "postgresql", "h", 5432, "d")
            .with_option("tls", json!({"y": 2, "x": 1, "inner": {"b": [{"q": 1, "p": 2}], "a": true}}));
        let b = DataSourceConfig::new("x", "postgresql", "h", 5432, "d")
            .with_option("tls", json!({"inner": {"a": true, "b": [{"p": 2, "q": 1}]}, "x": 1, "y": 2}));

        assert_eq!(ConfigSignature::of(&a), ConfigSignature::of(&b));

        let c = DataSourceConfig::new("x", "postgresql", "h", 5432, "d")
            .with_option("tls", json!({"x": 1, "y": 3}));
        assert_ne!(ConfigSignature::of(&a), ConfigSignature::of(&c));
    }

    #[test]
    fn test_canonical_value_sorts_keys() {
        let value = canonical_value(&json!({"z": {"b": 1, "a": 2}, "m": 0}));
        assert_eq!(value.to_string(), r#"{"m":0,"z":{"a":2,"b":1}}"#);
    }

    #[test]
    fn test_signature_changes_with_connection_fields() {
        let base = sample();
        let base_sig = ConfigSignature::of(&base);

        let mut host = base.clone();
        host.host = "db2".to_string();
        assert_ne!(ConfigSignature::of(&host), base_sig);

        let mut port = base.clone();
        port.port = 5433;
        assert_ne!(ConfigSignature::of(&port), base_sig);

        let mut ssl = base.clone();
        ssl.ssl = true;
        assert_ne!(ConfigSignature::of(&ssl), base_sig);

        let mut option = base.clone();
        option.connection_options.insert("max_pool_size".to_string(), json!(6));
        assert_ne!(ConfigSignature::of(&option), base_sig);

        let mut password = base.clone();
        password.password = Some("rotated".to_string());
        assert_ne!(ConfigSignature::of(&password), base_sig);

        let mut alias = base.clone();
        alias.source_type = "postgres".to_string();
        assert_eq!(ConfigSignature::of(&alias), base_sig);
    }

    #[test]
    fn test_redacted_url_hides_password() {
        let url = sample().redacted_url();
        assert!(url.starts_with("postgresql://reader@db:5432/app"));
        assert!(!url.contains("secret"));
    }

    #[test]
    fn test_password_not_serialized() {
        let value = serde_json::to_value(sample()).unwrap();
        assert!(value.get("password").is_none());
        assert_eq!(value["type"], "postgresql");
        assert!(value.get("connectionOptions").is_some());
    }

    #[test]
    fn test_request_defaults_port() {
        let request: DataSourceRequest = serde_json::from_value(json!({
            "name": "Mongo",
            "type": "mongo",
            "host": "localhost",
            "database": "app"
        }))
        .unwrap();

        let config = request.into_config(None).unwrap();
        assert_eq!(config.port, 27017);
        assert_eq!(config.source_type, "mongodb");
    }

    #[test]
    fn test_request_rejects_unknown_type() {
        let request: DataSourceRequest = serde_json::from_value(json!({
            "name": "Cache",
            "type": "redis",
            "host": "localhost",
            "database": "0"
        }))
        .unwrap();

        assert!(matches!(request.into_config(None), Err(AppError::Configuration(_))));
    }
}
