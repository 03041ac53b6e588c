// Driver abstraction for the supported backends.
//
// Each backend implements `DatabaseDriver` (how to open connections and what
// its catalog and cancel statements look like) and hands out boxed
// `DriverConnection`s. The pool and connectors only talk to these traits.

use std::fmt;
use thiserror::Error;

use crate::error::CoreError;
use crate::models::{DatabaseProfile, DatabaseType, QueryParam, RowSet};

/// Coarse classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorClass {
    Network,
    Deadlock,
    ConnectTimeout,
    Authentication,
    Syntax,
    Permission,
    Constraint,
    Timeout,
    Other,
}

impl fmt::Display for DriverErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverErrorClass::Network => "network",
            DriverErrorClass::Deadlock => "deadlock",
            DriverErrorClass::ConnectTimeout => "connect timeout",
            DriverErrorClass::Authentication => "authentication",
            DriverErrorClass::Syntax => "syntax",
            DriverErrorClass::Permission => "permission",
            DriverErrorClass::Constraint => "constraint",
            DriverErrorClass::Timeout => "timeout",
            DriverErrorClass::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DriverError {
    pub class: DriverErrorClass,
    pub code: Option<i64>,
    pub message: String,
}

impl DriverError {
    pub fn new(class: DriverErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    /// Network resets, deadlocks and lock timeouts, and connect timeouts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.class,
            DriverErrorClass::Network | DriverErrorClass::Deadlock | DriverErrorClass::ConnectTimeout
        )
    }

    /// Map into the public taxonomy, keeping the driver's message.
    pub fn into_core(self, attempts: u32) -> CoreError {
        if self.is_transient() {
            CoreError::TransientBackend {
                message: self.message,
                code: self.code,
                attempts,
            }
        } else {
            CoreError::PermanentBackend {
                message: self.message,
                code: self.code,
            }
        }
    }
}

/// One physical session with a backend.
///
/// A connection is used by one query at a time; `&mut self` on the query
/// methods makes that explicit.
#[async_trait::async_trait]
pub trait DriverConnection: Send {
    /// Server-side session identifier, captured when the session was opened.
    fn session_id(&self) -> Option<&str>;

    /// Cheap liveness check.
    async fn ping(&mut self) -> Result<(), DriverError>;

    /// Apply a server-side timeout directive. Returns `false` when the backend
    /// has none and only the client deadline applies.
    async fn set_statement_timeout(&mut self, timeout_ms: u64) -> Result<bool, DriverError>;

    /// Run a statement. With `max_rows` set, at most `max_rows` rows are
    /// returned and `has_more` reports whether the server had more.
    async fn query(
        &mut self,
        sql: &str,
        params: &[QueryParam],
        max_rows: Option<usize>,
    ) -> Result<RowSet, DriverError>;

    /// Close the session; the connection is dropped right after.
    async fn close(&mut self);
}

/// Factory and dialect knowledge for one backend.
#[async_trait::async_trait]
pub trait DatabaseDriver: Send + Sync {
    fn database_type(&self) -> DatabaseType;

    async fn connect(
        &self,
        profile: &DatabaseProfile,
    ) -> Result<Box<dyn DriverConnection>, DriverError>;

    /// Statement that cancels the work of `session_id`, issued from another session.
    fn cancel_sql(&self, session_id: &str) -> Option<String>;

    /// Catalog query returning rows of
    /// (schema, table, column, data type, nullable, is primary key).
    fn columns_sql(&self, profile: &DatabaseProfile) -> String;

    /// Catalog query returning rows of
    /// (schema, table, column, referenced table, referenced column).
    fn foreign_keys_sql(&self, profile: &DatabaseProfile) -> String;

    fn is_transient_error(&self, error: &DriverError) -> bool {
        error.is_transient()
    }
}

/// Validate an identifier that gets spliced into a catalog or cancel statement.
pub(crate) fn is_plain_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '#')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DriverError::new(DriverErrorClass::Deadlock, "deadlock victim").is_transient());
        assert!(DriverError::new(DriverErrorClass::Network, "reset").is_transient());
        assert!(!DriverError::new(DriverErrorClass::Syntax, "near FROM").is_transient());
        assert!(!DriverError::new(DriverErrorClass::Authentication, "login failed").is_transient());
    }

    #[test]
    fn test_into_core_keeps_message_and_code() {
        let err = DriverError::new(DriverErrorClass::Deadlock, "Transaction was deadlocked")
            .with_code(1205)
            .into_core(3);
        match err {
            CoreError::TransientBackend { message, code, attempts } => {
                assert_eq!(message, "Transaction was deadlocked");
                assert_eq!(code, Some(1205));
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = DriverError::new(DriverErrorClass::Permission, "denied").into_core(1);
        assert!(matches!(err, CoreError::PermanentBackend { .. }));
    }

    #[test]
    fn test_plain_identifier() {
        assert!(is_plain_identifier("dbo"));
        assert!(is_plain_identifier("SALES_2024"));
        assert!(!is_plain_identifier("x'; DROP"));
        assert!(!is_plain_identifier(""));
    }
}
