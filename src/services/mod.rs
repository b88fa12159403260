pub mod adapter_registry;
pub mod database; // Engine adapters: PostgreSQL, MySQL, MongoDB
pub mod query_cache; // Result cache with Redis and in-memory backends
pub mod query_gateway;

pub use adapter_registry::*;
pub use query_cache::*;
pub use query_gateway::*;
