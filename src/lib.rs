//! Data source gateway: engine adapters, a connection registry, a
//! read-only query pipeline with result caching, and its HTTP surface.

pub mod api;
pub mod config;
pub mod models;
pub mod services;
pub mod storage;
pub mod validation;

pub use models::*;
pub use services::*;
pub use validation::*;
