use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::api::middleware::AppError;
use crate::models::{ConfigSignature, DataSourceConfig};
use crate::services::database::{BuildAdapter, DataSourceAdapter, DatabaseAdapter, PoolSettings};

struct RegistryEntry<A> {
    adapter: Arc<A>,
    signature: ConfigSignature,
}

/// Registry holding one live adapter per data source id.
///
/// An entry is replaced when the stored config's signature changes; the stale
/// adapter is disconnected in the background. Entries are never evicted
/// implicitly, only through `close`, `close_all` or a signature change.
pub struct AdapterRegistry<A = DataSourceAdapter> {
    entries: RwLock<HashMap<String, RegistryEntry<A>>>,
    settings: PoolSettings,
}

impl<A> AdapterRegistry<A>
where
    A: DatabaseAdapter + BuildAdapter + 'static,
{
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Return the adapter registered for `config.id`, replacing it if the
    /// config changed since it was built. The adapter is not connected here.
    /// This method is safe to call concurrently from multiple tasks
    pub async fn create_or_reuse(&self, config: &DataSourceConfig) -> Result<Arc<A>, AppError> {
        let signature = ConfigSignature::of(config);

        // Fast path: matching entry under the read lock
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&config.id) {
                if entry.signature == signature {
                    tracing::debug!("Reusing adapter for data source {}", config.id);
                    return Ok(entry.adapter.clone());
                }
            }
        }

        // Slow path: create or replace under the write lock
        let mut entries = self.entries.write().await;

        // Double-check in case another task registered it while we were waiting
        if let Some(entry) = entries.get(&config.id) {
            if entry.signature == signature {
                tracing::debug!("Adapter registered by another task for {}", config.id);
                return Ok(entry.adapter.clone());
            }
        }

        if let Some(stale) = entries.remove(&config.id) {
            tracing::info!(
                "Configuration changed for data source {}, replacing adapter",
                config.id
            );
            Self::teardown_in_background(config.id.clone(), stale.adapter);
        }

        let adapter = Arc::new(A::build(config, &self.settings)?);
        entries.insert(
            config.id.clone(),
            RegistryEntry {
                adapter: adapter.clone(),
                signature,
            },
        );

        tracing::info!(
            "Registered {} adapter for data source {} ({})",
            adapter.engine().display_name(),
            config.id,
            config.redacted_url()
        );

        Ok(adapter)
    }

    fn teardown_in_background(id: String, adapter: Arc<A>) {
        tokio::spawn(async move {
            if let Err(e) = adapter.disconnect().await {
                tracing::warn!("Failed to disconnect stale adapter for {}: {}", id, e);
            }
        });
    }

    /// Whether `adapter` is still the registered entry for `id`. A caller
    /// holding a replaced adapter must not keep a pool open on it.
    pub async fn is_current(&self, id: &str, adapter: &Arc<A>) -> bool {
        self.entries
            .read()
            .await
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.adapter, adapter))
    }

    pub async fn get(&self, id: &str) -> Option<Arc<A>> {
        self.entries.read().await.get(id).map(|entry| entry.adapter.clone())
    }

    /// Disconnect and remove one entry. Returns whether an entry existed.
    pub async fn close(&self, id: &str) -> bool {
        let removed = self.entries.write().await.remove(id);

        match removed {
            Some(entry) => {
                if let Err(e) = entry.adapter.disconnect().await {
                    tracing::warn!("Failed to disconnect adapter for {}: {}", id, e);
                }
                tracing::info!("Closed adapter for data source {}", id);
                true
            }
            None => false,
        }
    }

    /// Disconnect and remove every entry, waiting for all disconnects
    pub async fn close_all(&self) {
        let drained: Vec<(String, RegistryEntry<A>)> = self.entries.write().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        tracing::info!("Closing {} adapters", drained.len());
        let disconnects = drained.into_iter().map(|(id, entry)| async move {
            if let Err(e) = entry.adapter.disconnect().await {
                tracing::warn!("Failed to disconnect adapter for {}: {}", id, e);
            }
        });
        futures::future::join_all(disconnects).await;
    }

    pub async fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::mock::MockAdapter;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn registry() -> AdapterRegistry<MockAdapter> {
        AdapterRegistry::new(PoolSettings::default())
    }

    fn config(id: &str) -> DataSourceConfig {
        let mut config = DataSourceConfig::new("Primary", "postgresql", "localhost", 5432, "app");
        config.id = id.to_string();
        config
    }

    #[tokio::test]
    async fn test_reuse_for_unchanged_config() {
        let registry = registry();
        let first = registry.create_or_reuse(&config("a")).await.unwrap();

        let mut renamed = config("a");
        renamed.name = "Renamed".to_string();
        let second = registry.create_or_reuse(&renamed).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.active_ids().await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_replace_on_signature_change() {
        let registry = registry();
        let first = registry.create_or_reuse(&config("a")).await.unwrap();
        first.connect().await.unwrap();

        let mut moved = config("a");
        moved.host = "replica".to_string();
        let second = registry.create_or_reuse(&moved).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&registry.get("a").await.unwrap(), &second));
        assert_eq!(registry.active_ids().await.len(), 1);

        // Stale adapter is torn down in the background
        for _ in 0..50 {
            if first.disconnects.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(first.disconnects.load(Ordering::SeqCst), 1);
        assert!(!first.is_connected());

        assert!(registry.is_current("a", &second).await);
        assert!(!registry.is_current("a", &first).await);
        assert!(!registry.is_current("b", &second).await);
    }

    #[tokio::test]
    async fn test_concurrent_create_yields_one_adapter() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.create_or_reuse(&config("shared")).await.unwrap()
            }));
        }

        let adapters: Vec<Arc<MockAdapter>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        for adapter in &adapters[1..] {
            assert!(Arc::ptr_eq(&adapters[0], adapter));
        }
        assert_eq!(registry.active_ids().await, vec!["shared"]);
    }

    #[tokio::test]
    async fn test_unknown_type_is_configuration_error() {
        let registry = registry();
        let mut bad = config("x");
        bad.source_type = "cassandra".to_string();

        assert!(matches!(
            registry.create_or_reuse(&bad).await,
            Err(AppError::Configuration(_))
        ));
        assert!(registry.get("x").await.is_none());
    }

    #[tokio::test]
    async fn test_close_and_close_all() {
        let registry = registry();
        let a = registry.create_or_reuse(&config("a")).await.unwrap();
        let b = registry.create_or_reuse(&config("b")).await.unwrap();
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        assert!(registry.close("a").await);
        assert!(!registry.close("a").await);
        assert_eq!(a.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_ids().await, vec!["b"]);

        let c = registry
            .create_or_reuse(&config("c").with_option("mock_rows", json!(2)))
            .await
            .unwrap();
        c.connect().await.unwrap();

        registry.close_all().await;
        assert!(registry.active_ids().await.is_empty());
        assert!(!b.is_connected());
        assert!(!c.is_connected());
    }
}
