pub mod profile;
pub mod query;
pub mod schema;
pub mod validation;

pub use profile::*;
pub use query::*;
pub use schema::*;
pub use validation::*;
