pub mod datasource;
pub mod metadata;
pub mod query;

pub use datasource::*;
pub use metadata::*;
pub use query::*;
