pub mod connection_pool;
pub mod database; // Backend drivers and connectors (MSSQL, HANA)
pub mod dialect; // Rule-table dialect translation
pub mod query_tracker;
pub mod registry;
pub mod schema_cache;

pub use connection_pool::*;
pub use database::{create_driver, Connector, DatabaseDriver, DriverConnection, DriverError, DriverErrorClass};
pub use dialect::*;
pub use query_tracker::*;
pub use registry::ConnectorRegistry;
pub use schema_cache::{CacheStats, SchemaCache};
