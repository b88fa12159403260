pub mod datasource;
pub mod metadata;
pub mod query;

use std::sync::Arc;

use crate::services::QueryGateway;
use crate::storage::ConfigStore;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConfigStore>,
    pub gateway: Arc<QueryGateway>,
}
