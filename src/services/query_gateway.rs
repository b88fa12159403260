use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::middleware::AppError;
use crate::models::{
    ConfigSignature, ConnectionStatus, DataSourceConfig, QueryOutcome, QueryResult, SchemaColumn,
    SchemaTable,
};
use crate::services::adapter_registry::AdapterRegistry;
use crate::services::database::mongodb::parse_document_query;
use crate::services::database::{BuildAdapter, DataSourceAdapter, DatabaseAdapter};
use crate::services::query_cache::QueryCache;
use crate::storage::ConfigStore;
use crate::validation::{QueryViolation, SqlValidator};

/// Upper bound for table previews, whatever the caller asks for
const MAX_PREVIEW_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub query_timeout: Duration,
    pub preview_limit: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            preview_limit: 100,
        }
    }
}

/// Entry point for every data source operation.
///
/// Resolves the config by id, validates query text for the source's engine,
/// consults the result cache and runs the text on the registry's adapter.
pub struct QueryGateway<A = DataSourceAdapter> {
    store: Arc<dyn ConfigStore>,
    registry: Arc<AdapterRegistry<A>>,
    cache: QueryCache,
    settings: GatewaySettings,
}

impl<A> QueryGateway<A>
where
    A: DatabaseAdapter + BuildAdapter + 'static,
{
    pub fn new(
        store: Arc<dyn ConfigStore>,
        registry: Arc<AdapterRegistry<A>>,
        cache: QueryCache,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry<A>> {
        &self.registry
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Validate and run `text` against data source `config_id`
    pub async fn execute(
        &self,
        config_id: &str,
        text: &str,
        use_cache: bool,
    ) -> Result<QueryOutcome, AppError> {
        let start = Instant::now();

        if text.trim().is_empty() {
            return Err(QueryViolation::Empty.into());
        }

        let config = self.load_config(config_id).await?;
        Self::validate_text(&config, text)?;

        let use_cache = use_cache && self.cache.is_enabled();
        let cache_key = QueryCache::key(&config.id, &ConfigSignature::of(&config), text);

        if use_cache {
            if let Some(entry) = self.cache.lookup(&cache_key).await {
                let duration = start.elapsed().as_millis() as u64;
                tracing::debug!("Cache hit for data source {} ({} rows)", config.id, entry.row_count);
                return Ok(QueryOutcome {
                    result: entry.into_result(duration),
                    cached: true,
                });
            }
            tracing::debug!("Cache miss for data source {}", config.id);
        }

        let adapter = self.acquire(&config).await?;
        let result = self.run_with_timeout(adapter.as_ref(), text).await.map_err(|e| {
            tracing::error!("Query failed on data source {}: {}", config.id, e);
            e
        })?;

        tracing::info!(
            "Executed query on data source {}: {} rows in {}ms",
            config.id,
            result.row_count,
            result.duration
        );

        if use_cache {
            self.cache.store(&cache_key, &result).await;
        }

        Ok(QueryOutcome {
            result,
            cached: false,
        })
    }

    /// Run the engine-specific safety checks without touching any adapter
    fn validate_text(config: &DataSourceConfig, text: &str) -> Result<(), AppError> {
        let engine = config.engine()?;
        if engine.is_document_store() {
            SqlValidator::validate_document_text(text)?;
            parse_document_query(text)?;
        } else {
            SqlValidator::validate_read_only(text, engine.into())?;
        }
        Ok(())
    }

    async fn run_with_timeout(&self, adapter: &A, text: &str) -> Result<QueryResult, AppError> {
        match tokio::time::timeout(self.settings.query_timeout, adapter.execute_query(text)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Execution(format!(
                "Query timeout after {} seconds",
                self.settings.query_timeout.as_secs()
            ))),
        }
    }

    async fn load_config(&self, config_id: &str) -> Result<DataSourceConfig, AppError> {
        self.store
            .get(config_id)
            .await?
            .ok_or_else(|| AppError::Configuration(format!("Data source not found: {}", config_id)))
    }

    /// Registry adapter for `config`, connected
    async fn acquire(&self, config: &DataSourceConfig) -> Result<Arc<A>, AppError> {
        let adapter = self.registry.create_or_reuse(config).await?;
        self.connect_current(config, adapter).await
    }

    /// Connect `adapter`. If the registry replaced it in the meantime its
    /// background teardown may already have run, so the pool just opened is
    /// closed again and the current entry is used instead.
    async fn connect_current(&self, config: &DataSourceConfig, adapter: Arc<A>) -> Result<Arc<A>, AppError> {
        Self::connect_adapter(config, &adapter).await?;
        if self.registry.is_current(&config.id, &adapter).await {
            return Ok(adapter);
        }

        tracing::debug!("Adapter for data source {} was replaced while connecting", config.id);
        if let Err(e) = adapter.disconnect().await {
            tracing::warn!("Failed to disconnect replaced adapter for {}: {}", config.id, e);
        }

        let current = self.registry.create_or_reuse(config).await?;
        Self::connect_adapter(config, &current).await?;
        Ok(current)
    }

    async fn connect_adapter(config: &DataSourceConfig, adapter: &A) -> Result<(), AppError> {
        adapter.connect().await.map_err(|e| {
            tracing::error!("Failed to connect data source {}: {}", config.id, e);
            e
        })
    }

    async fn connected(&self, config_id: &str) -> Result<Arc<A>, AppError> {
        let config = self.load_config(config_id).await?;
        self.acquire(&config).await
    }

    pub async fn get_schemas(&self, config_id: &str) -> Result<Vec<String>, AppError> {
        self.connected(config_id).await?.get_schemas().await
    }

    pub async fn get_tables(
        &self,
        config_id: &str,
        schema: Option<&str>,
    ) -> Result<Vec<SchemaTable>, AppError> {
        if let Some(schema) = schema {
            SqlValidator::validate_identifier(schema)?;
        }
        self.connected(config_id).await?.get_tables(schema).await
    }

    pub async fn get_table_schema(
        &self,
        config_id: &str,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<SchemaColumn>, AppError> {
        SqlValidator::validate_identifier(table)?;
        if let Some(schema) = schema {
            SqlValidator::validate_identifier(schema)?;
        }
        self.connected(config_id).await?.get_table_schema(table, schema).await
    }

    /// First rows of a table, never served from the cache
    pub async fn preview_table(
        &self,
        config_id: &str,
        table: &str,
        schema: Option<&str>,
        limit: Option<usize>,
    ) -> Result<QueryResult, AppError> {
        SqlValidator::validate_identifier(table)?;
        if let Some(schema) = schema {
            SqlValidator::validate_identifier(schema)?;
        }

        let limit = limit
            .unwrap_or(self.settings.preview_limit)
            .clamp(1, MAX_PREVIEW_LIMIT);

        let adapter = self.connected(config_id).await?;
        let text = adapter.preview_query(table, schema, limit);
        tracing::debug!("Previewing {} on data source {}", table, config_id);
        self.run_with_timeout(adapter.as_ref(), &text).await
    }

    /// Connect (if needed) and check the source. Failures are reported in the
    /// returned status rather than as an error.
    pub async fn test_connection(&self, config_id: &str) -> Result<ConnectionStatus, AppError> {
        let config = self.load_config(config_id).await?;
        let adapter = self.registry.create_or_reuse(&config).await?;

        let reachable = adapter.test_connection().await;
        tracing::info!(
            "Connection test for data source {}: {}",
            config_id,
            if reachable { "ok" } else { "failed" }
        );

        let mut status = adapter.connection_status();
        status.connected = reachable;
        Ok(status)
    }

    /// Status of the live adapter, or disconnected if none is registered
    pub async fn connection_status(&self, config_id: &str) -> Result<ConnectionStatus, AppError> {
        self.load_config(config_id).await?;
        Ok(self
            .registry
            .get(config_id)
            .await
            .map(|adapter| adapter.connection_status())
            .unwrap_or_default())
    }

    pub async fn close_adapter(&self, config_id: &str) -> bool {
        self.registry.close(config_id).await
    }

    pub async fn close_all(&self) {
        self.registry.close_all().await
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.registry.active_ids().await
    }

    /// Drop cached results for one source, or all of them
    pub async fn clear_cache(&self, config_id: Option<&str>) -> usize {
        self.cache.clear(config_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::mock::MockAdapter;
    use crate::services::database::PoolSettings;
    use crate::services::query_cache::{CacheBackend, CacheError, MemoryCache};
    use crate::storage::SqliteConfigStore;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Harness {
        gateway: QueryGateway<MockAdapter>,
        store: Arc<SqliteConfigStore>,
    }

    async fn harness_with(settings: GatewaySettings) -> Harness {
        let cache = QueryCache::new(Some(Arc::new(MemoryCache::new(100))), 300);
        harness_with_cache(cache, settings).await
    }

    async fn harness_with_cache(cache: QueryCache, settings: GatewaySettings) -> Harness {
        let store = Arc::new(SqliteConfigStore::in_memory().await.unwrap());
        let registry = Arc::new(AdapterRegistry::new(PoolSettings::default()));
        let gateway = QueryGateway::new(store.clone(), registry, cache, settings);
        Harness { gateway, store }
    }

    /// Cache backend that is down for every call
    struct UnreachableCache;

    #[async_trait::async_trait]
    impl CacheBackend for UnreachableCache {
        fn name(&self) -> &'static str {
            "unreachable"
        }
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }
        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: u64) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }
        async fn del(&self, _keys: &[String]) -> Result<usize, CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }
        async fn keys(&self, _pattern: &str) -> Result<Vec<String>, CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }
    }

    async fn harness() -> Harness {
        harness_with(GatewaySettings::default()).await
    }

    impl Harness {
        async fn add(&self, config: DataSourceConfig) -> String {
            let id = config.id.clone();
            self.store.save(&config).await.unwrap();
            id
        }

        async fn adapter(&self, id: &str) -> Arc<MockAdapter> {
            self.gateway.registry().get(id).await.unwrap()
        }
    }

    fn postgres() -> DataSourceConfig {
        DataSourceConfig::new("Primary", "postgresql", "localhost", 5432, "app")
    }

    fn mongo() -> DataSourceConfig {
        DataSourceConfig::new("Events", "mongodb", "localhost", 27017, "events")
    }

    #[tokio::test]
    async fn test_empty_text_rejected_before_config_lookup() {
        let h = harness().await;
        let err = h.gateway.execute("no-such-id", "   ", true).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidQuery(QueryViolation::Empty)));
    }

    #[tokio::test]
    async fn test_unknown_source_is_configuration_error() {
        let h = harness().await;
        let err = h.gateway.execute("no-such-id", "SELECT 1", true).await.unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_rejected_text_never_acquires_adapter() {
        let h = harness().await;
        let id = h.add(postgres()).await;

        for text in ["DROP TABLE users", "SELECT 1; SELECT 2", "SELECT * FROM t WHERE x IN (DELETE FROM y)"] {
            let err = h.gateway.execute(&id, text, true).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidQuery(_)), "{} was accepted", text);
        }
        assert!(h.gateway.active_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_call_served_from_cache() {
        let h = harness().await;
        let id = h.add(postgres().with_option("mock_rows", json!(3))).await;

        let first = h.gateway.execute(&id, "SELECT n FROM t", true).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.result.row_count, 3);

        let second = h.gateway.execute(&id, "SELECT n FROM t", true).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.result.data, first.result.data);
        assert_eq!(second.result.columns, vec!["n"]);

        let adapter = h.adapter(&id).await;
        assert_eq!(adapter.executions.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_bypass_always_executes() {
        let h = harness().await;
        let id = h.add(postgres()).await;

        h.gateway.execute(&id, "SELECT 1", true).await.unwrap();
        let fresh = h.gateway.execute(&id, "SELECT 1", false).await.unwrap();

        assert!(!fresh.cached);
        assert_eq!(h.adapter(&id).await.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_cache_still_executes() {
        let cache = QueryCache::new(Some(Arc::new(UnreachableCache)), 300);
        let h = harness_with_cache(cache, GatewaySettings::default()).await;
        let id = h.add(postgres()).await;

        for _ in 0..2 {
            let outcome = h.gateway.execute(&id, "SELECT 1", true).await.unwrap();
            assert!(!outcome.cached);
            assert_eq!(outcome.result.row_count, 1);
        }
        assert_eq!(h.adapter(&id).await.executions.load(Ordering::SeqCst), 2);
        assert_eq!(h.gateway.clear_cache(Some(&id)).await, 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_still_executes() {
        let h = harness_with_cache(QueryCache::disabled(), GatewaySettings::default()).await;
        let id = h.add(postgres()).await;

        for _ in 0..2 {
            let outcome = h.gateway.execute(&id, "SELECT 1", true).await.unwrap();
            assert!(!outcome.cached);
            assert_eq!(outcome.result.row_count, 1);
        }
        assert_eq!(h.adapter(&id).await.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_results_are_not_cached() {
        let h = harness().await;
        let id = h.add(postgres().with_option("mock_rows", json!(0))).await;

        h.gateway.execute(&id, "SELECT 1", true).await.unwrap();
        let again = h.gateway.execute(&id, "SELECT 1", true).await.unwrap();

        assert!(!again.cached);
        assert_eq!(h.adapter(&id).await.executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_config_change_replaces_adapter_and_misses_cache() {
        let h = harness().await;
        let mut config = postgres();
        let id = h.add(config.clone()).await;

        h.gateway.execute(&id, "SELECT 1", true).await.unwrap();
        let before = h.adapter(&id).await;

        config.host = "replica".to_string();
        h.add(config).await;

        let outcome = h.gateway.execute(&id, "SELECT 1", true).await.unwrap();
        assert!(!outcome.cached);

        let after = h.adapter(&id).await;
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_adapter_replaced_while_connecting_is_closed() {
        let h = harness().await;
        let original = postgres();
        let id = h.add(original.clone()).await;

        let stale = h.gateway.registry().create_or_reuse(&original).await.unwrap();
        let mut moved = original.clone();
        moved.host = "replica".to_string();
        h.store.save(&moved).await.unwrap();
        h.gateway.registry().create_or_reuse(&moved).await.unwrap();

        let current = h.gateway.connect_current(&moved, stale.clone()).await.unwrap();

        assert!(!Arc::ptr_eq(&current, &stale));
        assert!(h.gateway.registry().is_current(&id, &current).await);
        assert!(current.is_connected());
        assert!(!stale.is_connected());
        assert_eq!(stale.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_original_text_is_executed() {
        let h = harness().await;
        let id = h.add(postgres()).await;
        let text = "SELECT 'a -- b' AS x /* note */";

        h.gateway.execute(&id, text, false).await.unwrap();
        let adapter = h.adapter(&id).await;
        assert_eq!(adapter.last_query.lock().unwrap().as_deref(), Some(text));
    }

    #[tokio::test]
    async fn test_execution_error_passes_through() {
        let h = harness().await;
        let id = h.add(postgres().with_option("mock_error", json!("column \"x\" does not exist"))).await;

        match h.gateway.execute(&id, "SELECT x FROM t", true).await {
            Err(AppError::Execution(message)) => assert_eq!(message, "column \"x\" does not exist"),
            other => panic!("unexpected outcome: {:?}", other.map(|o| o.cached)),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let h = harness().await;
        let id = h.add(postgres().with_option("mock_fail_connect", json!(true))).await;

        let err = h.gateway.execute(&id, "SELECT 1", true).await.unwrap_err();
        assert!(matches!(err, AppError::Connection(_)));
    }

    #[tokio::test]
    async fn test_slow_query_times_out() {
        let h = harness_with(GatewaySettings {
            query_timeout: Duration::from_millis(50),
            preview_limit: 100,
        })
        .await;
        let id = h.add(postgres().with_option("mock_delay_ms", json!(500))).await;

        match h.gateway.execute(&id, "SELECT pg_sleep(1)", true).await {
            Err(AppError::Execution(message)) => assert!(message.contains("timeout")),
            other => panic!("expected timeout, got {:?}", other.map(|o| o.cached)),
        }
    }

    #[tokio::test]
    async fn test_document_source_accepts_shorthand_only() {
        let h = harness().await;
        let id = h.add(mongo()).await;

        let outcome = h
            .gateway
            .execute(&id, r#"db.events.find({"kind": "click"}).limit(5)"#, true)
            .await
            .unwrap();
        assert!(!outcome.cached);

        let sql = h.gateway.execute(&id, "SELECT * FROM events", true).await.unwrap_err();
        assert!(matches!(
            sql,
            AppError::InvalidQuery(QueryViolation::UnsupportedDocumentQuery(_))
        ));

        let multi = h
            .gateway
            .execute(&id, "db.a.find({}); db.b.find({})", true)
            .await
            .unwrap_err();
        assert!(matches!(
            multi,
            AppError::InvalidQuery(QueryViolation::MultipleStatements(2))
        ));
    }

    #[tokio::test]
    async fn test_metadata_pass_throughs() {
        let h = harness().await;
        let id = h.add(postgres()).await;

        assert_eq!(h.gateway.get_schemas(&id).await.unwrap(), vec!["public", "sales"]);

        let tables = h.gateway.get_tables(&id, Some("sales")).await.unwrap();
        assert_eq!(tables[0].schema.as_deref(), Some("sales"));

        let columns = h.gateway.get_table_schema(&id, "users", None).await.unwrap();
        assert!(columns[0].is_primary_key);

        let bad = h.gateway.get_table_schema(&id, "users; DROP", None).await.unwrap_err();
        assert!(matches!(
            bad,
            AppError::InvalidQuery(QueryViolation::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_preview_uses_default_and_clamped_limits() {
        let h = harness().await;
        let id = h.add(postgres()).await;

        h.gateway.preview_table(&id, "users", None, None).await.unwrap();
        let adapter = h.adapter(&id).await;
        assert_eq!(
            adapter.last_query.lock().unwrap().as_deref(),
            Some("SELECT * FROM public.users LIMIT 100")
        );

        h.gateway.preview_table(&id, "users", Some("sales"), Some(1_000_000)).await.unwrap();
        assert_eq!(
            adapter.last_query.lock().unwrap().as_deref(),
            Some("SELECT * FROM sales.users LIMIT 1000")
        );

        assert!(h.gateway.preview_table(&id, "us-ers", None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_status_and_test() {
        let h = harness().await;
        let id = h.add(postgres()).await;

        assert!(!h.gateway.connection_status(&id).await.unwrap().connected);
        assert!(h.gateway.test_connection(&id).await.unwrap().connected);
        assert!(h.gateway.connection_status(&id).await.unwrap().connected);

        let failing = h.add(postgres().with_option("mock_fail_connect", json!(true))).await;
        let status = h.gateway.test_connection(&failing).await.unwrap();
        assert!(!status.connected);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_clear_cache_and_close() {
        let h = harness().await;
        let a = h.add(postgres()).await;
        let b = h.add(postgres()).await;

        h.gateway.execute(&a, "SELECT 1", true).await.unwrap();
        h.gateway.execute(&b, "SELECT 1", true).await.unwrap();

        assert_eq!(h.gateway.clear_cache(Some(&a)).await, 1);
        assert!(!h.gateway.execute(&a, "SELECT 1", true).await.unwrap().cached);
        assert!(h.gateway.execute(&b, "SELECT 1", true).await.unwrap().cached);

        assert!(h.gateway.close_adapter(&a).await);
        assert_eq!(h.gateway.active_ids().await, vec![b.clone()]);

        h.gateway.close_all().await;
        assert!(h.gateway.active_ids().await.is_empty());
        assert_eq!(h.gateway.clear_cache(None).await, 2);
    }
}
