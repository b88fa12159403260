use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use datasource_gateway_backend::api::handlers::AppState;
use datasource_gateway_backend::api::routes::create_router;
use datasource_gateway_backend::config::Config;
use datasource_gateway_backend::services::{
    AdapterRegistry, MemoryCache, QueryCache, QueryGateway, RedisCache,
};
use datasource_gateway_backend::storage::{ConfigStore, SqliteConfigStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first so .env can supply RUST_LOG
    let config = Config::from_env()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("Starting server on {}", config.server_address());

    let store: Arc<dyn ConfigStore> = Arc::new(
        SqliteConfigStore::new(&config.database.url)
            .await
            .map_err(|e| {
                error!("Failed to open data source store: {}", e);
                e
            })?,
    );

    let cache = build_cache(&config).await;
    let registry = Arc::new(AdapterRegistry::new(config.pool_settings()));
    let gateway = Arc::new(QueryGateway::new(
        store.clone(),
        registry,
        cache,
        config.gateway_settings(),
    ));

    let app = create_router(AppState {
        store,
        gateway: gateway.clone(),
    });

    let addr: SocketAddr = config.server_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Closing data source connections");
    gateway.close_all().await;

    Ok(())
}

/// Redis when configured and reachable, then the in-process cache if enabled,
/// otherwise no result caching
async fn build_cache(config: &Config) -> QueryCache {
    let ttl = config.cache.ttl_secs;

    if let Some(url) = &config.cache.redis_url {
        match RedisCache::connect(url).await {
            Ok(redis) => {
                info!("Query cache: redis (ttl {}s)", ttl);
                return QueryCache::new(Some(Arc::new(redis)), ttl);
            }
            Err(e) => warn!("Redis unavailable, falling back: {}", e),
        }
    }

    if config.cache.in_memory {
        let memory = Arc::new(MemoryCache::new(config.cache.max_entries));
        spawn_cache_reaper(memory.clone());
        info!(
            "Query cache: in-memory ({} entries, ttl {}s)",
            config.cache.max_entries, ttl
        );
        return QueryCache::new(Some(memory), ttl);
    }

    info!("Query cache disabled");
    QueryCache::disabled()
}

/// Drop expired in-memory entries once a minute
fn spawn_cache_reaper(cache: Arc<MemoryCache>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            cache.cleanup_expired();
            tracing::debug!(
                "Query cache: {} entries, hit ratio {:.2}",
                cache.size(),
                cache.stats().hit_ratio()
            );
        }
    });
}

/// Wait for Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
