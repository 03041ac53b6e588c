// Backend drivers and the per-backend connector
pub mod connector;
pub mod driver;
pub mod hana;
pub mod mssql;

#[cfg(test)]
pub mod testing;

pub use connector::Connector;
pub use driver::{DatabaseDriver, DriverConnection, DriverError, DriverErrorClass};
pub use hana::HanaDriver;
pub use mssql::MssqlDriver;

use crate::models::DatabaseType;
use std::sync::Arc;

/// Factory function to create the driver for a backend kind
pub fn create_driver(db_type: DatabaseType) -> Arc<dyn DatabaseDriver> {
    match db_type {
        DatabaseType::Mssql => Arc::new(MssqlDriver::new()),
        DatabaseType::Hana => Arc::new(HanaDriver::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_driver_matches_type() {
        for db_type in DatabaseType::ALL {
            assert_eq!(create_driver(db_type).database_type(), db_type);
        }
    }
}
