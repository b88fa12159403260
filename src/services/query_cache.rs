// Query Result Cache Service
//
// Results are stored as JSON bytes behind a small key/value backend contract
// (Redis in production, an in-process LRU/TTL map otherwise). Every backend
// failure is logged and swallowed: the cache can only ever degrade to a miss.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::models::{ConfigSignature, QueryResult, Row};

pub const CACHE_KEY_PREFIX: &str = "query:";

/// Cache backend failures. Never converted into an API error.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache payload error: {0}")]
    Payload(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Minimal key/value contract the gateway needs from a cache
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), CacheError>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> Result<usize, CacheError>;

    /// Keys matching a glob pattern (`*`, `?` and `\` escapes)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
}

/// Redis-backed cache using a multiplexed, auto-reconnecting connection
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        tracing::debug!("Redis cache connection established");
        Ok(Self { connection })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        Ok(conn.del(keys).await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection.clone();
        Ok(conn.keys(pattern).await?)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
    last_accessed: Instant,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    stats: CacheStats,
}

/// In-process cache with LRU eviction and TTL
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    /// Remove expired entries
    pub fn cleanup_expired(&self) -> usize {
        let mut state = self.lock();
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - state.entries.len();
        state.stats.expirations += removed as u64;

        if removed > 0 {
            tracing::debug!("Cleaned up {} expired cache entries", removed);
        }
        removed
    }

    fn evict_lru(state: &mut MemoryState) {
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            state.entries.remove(&key);
            state.stats.evictions += 1;
            tracing::debug!("Evicted cache entry: {}", key);
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let now = Instant::now();

        let expired = match state.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed = now;
                let value = entry.value.clone();
                state.stats.hits += 1;
                return Ok(Some(value));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.remove(key);
            state.stats.expirations += 1;
        }
        state.stats.misses += 1;
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), CacheError> {
        let mut state = self.lock();

        if state.entries.len() >= self.max_entries && !state.entries.contains_key(key) {
            Self::evict_lru(&mut state);
        }

        let now = Instant::now();
        state.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: now + Duration::from_secs(ttl_secs),
                last_accessed: now,
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<usize, CacheError> {
        let mut state = self.lock();
        Ok(keys.iter().filter(|key| state.entries.remove(*key).is_some()).count())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let state = self.lock();
        let now = Instant::now();
        Ok(state
            .entries
            .iter()
            .filter(|(key, entry)| entry.expires_at > now && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Glob matching with `*` (any run), `?` (any single char) and `\` escapes
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p + 1 < pattern.len() && pattern[p] == '\\' {
            if pattern[p + 1] == text[t] {
                p += 2;
                t += 1;
                continue;
            }
        } else if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
            continue;
        }

        if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Escape the characters Redis `KEYS` treats as pattern syntax
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Data source id encoded in a `query:<id>:<hash>` key
fn key_owner(key: &str) -> Option<&str> {
    key.strip_prefix(CACHE_KEY_PREFIX)?
        .rsplit_once(':')
        .map(|(id, _)| id)
}

/// Serialized cache payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub columns: Vec<String>,
    pub data: Vec<Row>,
    pub row_count: usize,
    pub cached_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn from_result(result: &QueryResult, ttl_secs: u64) -> Self {
        Self {
            columns: result.columns.clone(),
            data: result.data.clone(),
            row_count: result.row_count,
            cached_at: Utc::now(),
            ttl_secs,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.cached_at).num_seconds() < self.ttl_secs as i64
    }

    /// Row count matches and every row has exactly the column key set
    pub fn is_well_formed(&self) -> bool {
        self.row_count == self.data.len()
            && self.data.iter().all(|row| {
                row.len() == self.columns.len() && self.columns.iter().all(|c| row.contains_key(c))
            })
    }

    pub fn into_result(self, duration: u64) -> QueryResult {
        QueryResult::new(self.columns, self.data, duration)
    }
}

/// Fail-open result cache used by the query gateway
#[derive(Clone)]
pub struct QueryCache {
    backend: Option<Arc<dyn CacheBackend>>,
    ttl_secs: u64,
}

impl QueryCache {
    pub fn new(backend: Option<Arc<dyn CacheBackend>>, ttl_secs: u64) -> Self {
        Self { backend, ttl_secs }
    }

    pub fn disabled() -> Self {
        Self::new(None, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    /// `query:<config id>:<sha256(signature || text)>` over the original text
    pub fn key(config_id: &str, signature: &ConfigSignature, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(signature.as_str().as_bytes());
        hasher.update(text.as_bytes());
        format!("{}{}:{}", CACHE_KEY_PREFIX, config_id, hex::encode(hasher.finalize()))
    }

    /// Fresh, well-formed entry for `key`, or `None` on any failure
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let backend = self.backend.as_ref()?;

        let bytes = match backend.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!("Cache miss for key: {}", key);
                return None;
            }
            Err(e) => {
                tracing::warn!("Cache read failed, continuing without cache: {}", e);
                return None;
            }
        };

        let entry = match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if !entry.is_well_formed() => {
                tracing::warn!("Discarding malformed cache entry: {}", key);
                None
            }
            Ok(entry) if !entry.is_fresh(Utc::now()) => {
                tracing::debug!("Cache expired for key: {}", key);
                None
            }
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Discarding unreadable cache entry {}: {}", key, e);
                None
            }
        };

        if entry.is_none() {
            if let Err(e) = backend.del(&[key.to_string()]).await {
                tracing::warn!("Failed to delete bad cache entry {}: {}", key, e);
            }
        } else {
            tracing::debug!("Cache hit for key: {}", key);
        }
        entry
    }

    /// Store a non-empty result; failures are logged and dropped
    pub async fn store(&self, key: &str, result: &QueryResult) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if result.is_empty() {
            return;
        }

        let bytes = match serde_json::to_vec(&CacheEntry::from_result(result, self.ttl_secs)) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("{}", CacheError::Payload(e.to_string()));
                return;
            }
        };

        match backend.set(key, bytes, self.ttl_secs).await {
            Ok(()) => tracing::debug!("Cached result for key: {} ({} rows)", key, result.row_count),
            Err(e) => tracing::warn!("Cache write failed, result not cached: {}", e),
        }
    }

    /// Remove cached results for one data source, or all of them
    pub async fn clear(&self, config_id: Option<&str>) -> usize {
        let Some(backend) = self.backend.as_ref() else {
            return 0;
        };

        let pattern = match config_id {
            Some(id) => format!("{}{}:*", CACHE_KEY_PREFIX, escape_glob(id)),
            None => format!("{}*", CACHE_KEY_PREFIX),
        };

        let keys = match backend.keys(&pattern).await {
            // Ids may contain `:`, so `query:a:*` also lists the keys of `a:b`
            Ok(keys) => match config_id {
                Some(id) => keys.into_iter().filter(|key| key_owner(key) == Some(id)).collect(),
                None => keys,
            },
            Err(e) => {
                tracing::warn!("Failed to list cache keys for {}: {}", pattern, e);
                return 0;
            }
        };

        match backend.del(&keys).await {
            Ok(count) => {
                tracing::info!("Cleared {} cache entries matching {}", count, pattern);
                count
            }
            Err(e) => {
                tracing::warn!("Failed to clear cache entries for {}: {}", pattern, e);
                0
            }
        }
    }
}
