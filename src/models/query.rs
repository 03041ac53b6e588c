use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::profile::DatabaseType;

/// Bind parameter passed alongside a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        QueryParam::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        QueryParam::Float(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        QueryParam::Bool(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        QueryParam::Text(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        QueryParam::Text(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Rows as read from a driver cursor, before they are stamped with a query id.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// The cursor still had rows when the row cap was reached.
    pub has_more: bool,
}

/// Canonical result handed back to callers. The core keeps no reference to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: Uuid,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub executed_sql: String,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn from_row_set(
        query_id: Uuid,
        row_set: RowSet,
        executed_sql: String,
        execution_time_ms: u64,
    ) -> Self {
        let row_count = row_set.rows.len();
        Self {
            query_id,
            columns: row_set.columns,
            rows: row_set.rows,
            row_count,
            truncated: row_set.has_more,
            executed_sql,
            execution_time_ms,
        }
    }

    /// Rows rendered as JSON objects keyed by column name.
    pub fn rows_as_objects(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (column, value) in self.columns.iter().zip(row.iter()) {
                    obj.insert(column.name.clone(), value.clone());
                }
                serde_json::Value::Object(obj)
            })
            .collect()
    }
}

/// Per-query lifecycle: `Registered → Executing → terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Registered,
    Executing,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryStatus::Completed | QueryStatus::Failed | QueryStatus::Cancelled | QueryStatus::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: QueryStatus) -> bool {
        match (self, next) {
            (QueryStatus::Registered, QueryStatus::Executing) => true,
            // a query may be cancelled before the driver call starts
            (QueryStatus::Registered, QueryStatus::Cancelled) => true,
            (QueryStatus::Executing, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// Full execution request. `timeout` and `max_rows` fall back to configured
/// defaults when unset.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub timeout: Option<Duration>,
    pub max_rows: Option<usize>,
    /// Dialect the SQL was written in, when it may differ from the target backend.
    pub source_dialect: Option<DatabaseType>,
    /// Apply advisor rewrites (read hint, row cap) before execution.
    pub optimize: bool,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            timeout: None,
            max_rows: None,
            source_dialect: None,
            optimize: false,
        }
    }

    pub fn with_params(mut self, params: Vec<QueryParam>) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn written_in(mut self, dialect: DatabaseType) -> Self {
        self.source_dialect = Some(dialect);
        self
    }

    pub fn optimized(mut self) -> Self {
        self.optimize = true;
        self
    }
}

/// Outcome of `test_connection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub ok: bool,
    pub message: String,
    pub latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        assert!(QueryStatus::Registered.can_transition_to(QueryStatus::Executing));
        assert!(QueryStatus::Executing.can_transition_to(QueryStatus::TimedOut));
        assert!(!QueryStatus::Completed.can_transition_to(QueryStatus::Cancelled));
        assert!(!QueryStatus::Registered.can_transition_to(QueryStatus::Completed));
    }

    #[test]
    fn test_result_from_row_set() {
        let row_set = RowSet {
            columns: vec![ColumnInfo::new("id", "int"), ColumnInfo::new("name", "nvarchar")],
            rows: vec![vec![json!(1), json!("widget")]],
            has_more: true,
        };
        let result = QueryResult::from_row_set(Uuid::new_v4(), row_set, "SELECT 1".to_string(), 4);
        assert_eq!(result.row_count, 1);
        assert!(result.truncated);
        assert_eq!(result.rows_as_objects()[0], json!({"id": 1, "name": "widget"}));
    }
}
