// Capability contract shared by every engine adapter
use crate::api::middleware::AppError;
use crate::models::{ConnectionStatus, DataSourceConfig, DataSourceType, QueryResult, SchemaColumn, SchemaTable};
use crate::services::database::PoolSettings;
use std::sync::Mutex;

/// Database adapter trait - one live connection pool per registered data source.
///
/// Adapters are created disconnected; `connect` is idempotent and safe to call
/// from concurrent tasks. Every other I/O method requires a prior `connect`.
#[async_trait::async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Engine kind this adapter talks to
    fn engine(&self) -> DataSourceType;

    /// Open the pool and perform one liveness round-trip
    async fn connect(&self) -> Result<(), AppError>;

    /// Release the pool; no-op when not connected
    async fn disconnect(&self) -> Result<(), AppError>;

    /// Connect lazily and check reachability. Never fails, only reports.
    async fn test_connection(&self) -> bool;

    /// Non-system namespaces (schemas or databases)
    async fn get_schemas(&self) -> Result<Vec<String>, AppError>;

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<SchemaTable>, AppError>;

    async fn get_table_schema(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<SchemaColumn>, AppError>;

    /// Run already-validated query text; duration covers the round-trip only
    async fn execute_query(&self, text: &str) -> Result<QueryResult, AppError>;

    /// Last known state, no I/O
    fn connection_status(&self) -> ConnectionStatus;

    /// Engine-native statement that reads the first `limit` rows of a table.
    /// Identifiers must already be validated.
    fn preview_query(&self, table: &str, schema: Option<&str>, limit: usize) -> String;
}

/// Synchronous, I/O-free construction from a stored config
pub trait BuildAdapter: Sized {
    fn build(config: &DataSourceConfig, settings: &PoolSettings) -> Result<Self, AppError>;
}

/// Connected flag and last error, readable without touching the pool
#[derive(Debug, Default)]
pub struct StatusTracker {
    inner: Mutex<ConnectionStatus>,
}

impl StatusTracker {
    pub fn mark_connected(&self) {
        let mut status = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        status.connected = true;
        status.error = None;
    }

    pub fn mark_disconnected(&self) {
        let mut status = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        status.connected = false;
    }

    pub fn record_failure(&self, message: impl Into<String>) {
        let mut status = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        status.connected = false;
        status.error = Some(message.into());
    }

    pub fn snapshot(&self) -> ConnectionStatus {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub(crate) fn not_connected(config: &DataSourceConfig) -> AppError {
    AppError::Connection(format!(
        "Data source '{}' is not connected",
        config.name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_tracker_transitions() {
        let tracker = StatusTracker::default();
        assert!(!tracker.snapshot().connected);

        tracker.record_failure("password authentication failed");
        let status = tracker.snapshot();
        assert!(!status.connected);
        assert_eq!(status.error.as_deref(), Some("password authentication failed"));

        tracker.mark_connected();
        assert_eq!(tracker.snapshot(), ConnectionStatus { connected: true, error: None });

        tracker.mark_disconnected();
        assert!(!tracker.snapshot().connected);
    }
}
