use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::services::database::PoolSettings;
use crate::services::GatewaySettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub query: QueryConfig,
    pub logging: LoggingConfig,
}

/// Where data source records are persisted
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    pub in_memory: bool,
    pub max_entries: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub max_size: usize,
    pub min_idle: usize,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    pub timeout_secs: u64,
    pub sample_size: usize,
    pub preview_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Environment variable → config key
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("DATABASE_URL", "database.url"),
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("REDIS_URL", "cache.redis_url"),
    ("CACHE_IN_MEMORY", "cache.in_memory"),
    ("CACHE_MAX_ENTRIES", "cache.max_entries"),
    ("CACHE_TTL_SECS", "cache.ttl_secs"),
    ("POOL_MAX_SIZE", "pool.max_size"),
    ("POOL_MIN_IDLE", "pool.min_idle"),
    ("POOL_CONNECT_TIMEOUT_SECS", "pool.connect_timeout_secs"),
    ("POOL_IDLE_TIMEOUT_SECS", "pool.idle_timeout_secs"),
    ("POOL_ACQUIRE_TIMEOUT_SECS", "pool.acquire_timeout_secs"),
    ("QUERY_TIMEOUT_SECS", "query.timeout_secs"),
    ("SCHEMA_SAMPLE_SIZE", "query.sample_size"),
    ("PREVIEW_LIMIT", "query.preview_limit"),
    ("RUST_LOG", "logging.level"),
];

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // .env values must be visible before the overrides are read
        let _ = dotenv::dotenv();
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build from defaults plus whatever `lookup` returns for each known variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self, config::ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder()
            .set_default("database.url", "./datasources.db")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("cache.in_memory", false)?
            .set_default("cache.max_entries", 1000)?
            .set_default("cache.ttl_secs", 300)?
            .set_default("pool.max_size", 10)?
            .set_default("pool.min_idle", 2)?
            .set_default("pool.connect_timeout_secs", 5)?
            .set_default("pool.idle_timeout_secs", 30)?
            .set_default("pool.acquire_timeout_secs", 10)?
            .set_default("query.timeout_secs", 30)?
            .set_default("query.sample_size", 100)?
            .set_default("query.preview_limit", 100)?
            .set_default("logging.level", "info")?;

        for (var, key) in ENV_OVERRIDES {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                builder = builder.set_override(*key, value)?;
            }
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.pool.max_size.max(1),
            min_idle: self.pool.min_idle,
            connect_timeout: Duration::from_secs(self.pool.connect_timeout_secs),
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            acquire_timeout: Duration::from_secs(self.pool.acquire_timeout_secs),
            sample_size: self.query.sample_size.max(1),
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            query_timeout: Duration::from_secs(self.query.timeout_secs.max(1)),
            preview_limit: self.query.preview_limit.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, config::ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.database.url, "./datasources.db");
        assert!(config.cache.redis_url.is_none());
        assert!(!config.cache.in_memory);
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.query.timeout_secs, 30);
        assert_eq!(config.pool_settings(), PoolSettings::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("REDIS_URL", "redis://cache:6379"),
            ("CACHE_IN_MEMORY", "true"),
            ("POOL_MAX_SIZE", "4"),
            ("QUERY_TIMEOUT_SECS", "5"),
            ("SCHEMA_SAMPLE_SIZE", "20"),
        ])
        .unwrap();

        assert_eq!(config.server_address(), "0.0.0.0:8080");
        assert_eq!(config.cache.redis_url.as_deref(), Some("redis://cache:6379"));
        assert!(config.cache.in_memory);
        assert_eq!(config.pool_settings().max_size, 4);
        assert_eq!(config.pool_settings().sample_size, 20);
        assert_eq!(config.gateway_settings().query_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config = config_from(&[("REDIS_URL", "  ")]).unwrap();
        assert!(config.cache.redis_url.is_none());
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        assert!(config_from(&[("PORT", "not-a-port")]).is_err());
    }
}
