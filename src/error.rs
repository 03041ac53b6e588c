use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed error taxonomy for the execution core.
///
/// Validation failures never reach the network layer. Backend failures are
/// always classified before they leave a connector so callers can tell
/// "retry later" apart from "fix the query".
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid query: {}", .reasons.join("; "))]
    InvalidQuery { reasons: Vec<String> },

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Connection pool exhausted for '{database}' after waiting {waited_ms} ms")]
    PoolExhausted { database: String, waited_ms: u64 },

    #[error("Transient backend error after {attempts} attempt(s): {message}")]
    TransientBackend {
        message: String,
        code: Option<i64>,
        attempts: u32,
    },

    #[error("Backend error: {message}")]
    PermanentBackend { message: String, code: Option<i64> },

    #[error("Query timed out after {timeout_ms} ms")]
    QueryTimeout { timeout_ms: u64 },

    #[error("Query {query_id} was cancelled")]
    QueryCancelled { query_id: String },

    #[error("Feature '{feature}' cannot be translated to {target}")]
    UntranslatableFeature { feature: String, target: String },
}

/// Taxonomy kind, detached from the error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidQuery,
    SchemaMismatch,
    PoolExhausted,
    TransientBackendError,
    PermanentBackendError,
    QueryTimeout,
    QueryCancelled,
    UntranslatableFeature,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidQuery => "INVALID_QUERY",
            ErrorKind::SchemaMismatch => "SCHEMA_MISMATCH",
            ErrorKind::PoolExhausted => "POOL_EXHAUSTED",
            ErrorKind::TransientBackendError => "TRANSIENT_BACKEND_ERROR",
            ErrorKind::PermanentBackendError => "PERMANENT_BACKEND_ERROR",
            ErrorKind::QueryTimeout => "QUERY_TIMEOUT",
            ErrorKind::QueryCancelled => "QUERY_CANCELLED",
            ErrorKind::UntranslatableFeature => "UNTRANSLATABLE_FEATURE",
        }
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidQuery { .. } => ErrorKind::InvalidQuery,
            CoreError::SchemaMismatch(_) => ErrorKind::SchemaMismatch,
            CoreError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            CoreError::TransientBackend { .. } => ErrorKind::TransientBackendError,
            CoreError::PermanentBackend { .. } => ErrorKind::PermanentBackendError,
            CoreError::QueryTimeout { .. } => ErrorKind::QueryTimeout,
            CoreError::QueryCancelled { .. } => ErrorKind::QueryCancelled,
            CoreError::UntranslatableFeature { .. } => ErrorKind::UntranslatableFeature,
        }
    }

    /// Whether the caller may reasonably try the same request again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::PoolExhausted { .. } | CoreError::TransientBackend { .. }
        )
    }

    /// User-facing rendering: taxonomy code plus the original message.
    pub fn to_detail(&self) -> ErrorDetail {
        let kind = self.kind();
        let detail = ErrorDetail::new(kind.code(), self.to_string());
        match self {
            CoreError::InvalidQuery { .. } => {
                detail.with_details("Only single read-only SELECT statements are allowed.")
            }
            CoreError::TransientBackend { .. } | CoreError::PoolExhausted { .. } => {
                detail.with_details("The database is temporarily unavailable. Retry later.")
            }
            CoreError::QueryTimeout { .. } => detail
                .with_details("Consider simplifying your query or narrowing the result set."),
            CoreError::UntranslatableFeature { feature, .. } => detail.with_details(format!(
                "Rewrite the query without '{}' for the target database.",
                feature
            )),
            _ => detail,
        }
    }
}

/// Error response format handed to collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_creation() {
        let detail = ErrorDetail::new("TEST_CODE", "Test message");
        assert_eq!(detail.code, "TEST_CODE");
        assert_eq!(detail.message, "Test message");
        assert!(detail.details.is_none());
    }

    #[test]
    fn test_invalid_query_lists_all_reasons() {
        let err = CoreError::InvalidQuery {
            reasons: vec!["first".to_string(), "second".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("first"));
        assert!(message.contains("second"));
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_kinds() {
        let pool = CoreError::PoolExhausted {
            database: "sales".to_string(),
            waited_ms: 100,
        };
        assert!(pool.is_retryable());

        let transient = CoreError::TransientBackend {
            message: "deadlock".to_string(),
            code: Some(1205),
            attempts: 3,
        };
        assert!(transient.is_retryable());

        let timeout = CoreError::QueryTimeout { timeout_ms: 10 };
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn test_detail_carries_code_and_driver_message() {
        let err = CoreError::PermanentBackend {
            message: "Invalid object name 'Prodcts'.".to_string(),
            code: Some(208),
        };
        let detail = err.to_detail();
        assert_eq!(detail.code, "PERMANENT_BACKEND_ERROR");
        assert!(detail.message.contains("Prodcts"));

        let json = serde_json::to_value(&detail).unwrap();
        assert!(json.get("details").is_none());
    }
}
