// Scripted in-memory driver for pool and connector tests.

use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::driver::{DatabaseDriver, DriverConnection, DriverError, DriverErrorClass};
use crate::models::{ColumnInfo, DatabaseProfile, DatabaseType, QueryParam, RowSet};

/// What the next user query does.
#[derive(Debug, Clone)]
pub enum Step {
    Rows(usize),
    Fail(DriverError),
    Hang,
    Delay(Duration, usize),
}

#[derive(Default)]
pub struct MockState {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub pings: AtomicUsize,
    pub failing_pings: AtomicUsize,
    pub failing_connects: AtomicUsize,
    pub hanging_connects: AtomicUsize,
    pub hanging_directives: AtomicUsize,
    pub statements: Mutex<Vec<String>>,
    script: Mutex<VecDeque<Step>>,
}

impl MockState {
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn user_statements(&self) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| !s.starts_with("SET ") && !s.starts_with("KILL") && !s.starts_with("ALTER SYSTEM"))
            .collect()
    }
}

pub struct MockDriver {
    database_type: DatabaseType,
    pub state: Arc<MockState>,
    /// Rows returned for catalog queries: (schema, table, column, type, nullable, pk).
    pub catalog: Vec<(String, String, String, String, bool, bool)>,
}

impl MockDriver {
    pub fn new(database_type: DatabaseType) -> Self {
        Self {
            database_type,
            state: Arc::new(MockState::default()),
            catalog: Vec::new(),
        }
    }

    pub fn with_catalog(mut self, catalog: Vec<(&str, &str, &str, &str, bool, bool)>) -> Self {
        self.catalog = catalog
            .into_iter()
            .map(|(s, t, c, d, n, p)| (s.into(), t.into(), c.into(), d.into(), n, p))
            .collect();
        self
    }

    pub fn script(&self, steps: Vec<Step>) {
        self.state.script.lock().unwrap().extend(steps);
    }

    pub fn fail_next_pings(&self, n: usize) {
        self.state.failing_pings.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn hang_next_connects(&self, n: usize) {
        self.state.hanging_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` statement-timeout directives never answer.
    pub fn hang_next_directives(&self, n: usize) {
        self.state.hanging_directives.store(n, Ordering::SeqCst);
    }
}

pub fn profile(database_type: DatabaseType, pool_size: usize) -> DatabaseProfile {
    DatabaseProfile::new(
        "test",
        database_type,
        "localhost",
        database_type.default_port(),
        crate::models::Credentials::new("user", "secret"),
    )
    .with_pool_size(pool_size)
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn rows(n: usize) -> RowSet {
    RowSet {
        columns: vec![ColumnInfo::new("id", "int"), ColumnInfo::new("name", "nvarchar")],
        rows: (0..n).map(|i| vec![json!(i), json!(format!("row{}", i))]).collect(),
        has_more: false,
    }
}

#[async_trait::async_trait]
impl DatabaseDriver for MockDriver {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    async fn connect(
        &self,
        _profile: &DatabaseProfile,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        if take_one(&self.state.hanging_connects) {
            futures::future::pending::<()>().await;
        }
        if take_one(&self.state.failing_connects) {
            return Err(DriverError::new(DriverErrorClass::Network, "connection refused"));
        }
        let n = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockConnection {
            session_id: n.to_string(),
            state: self.state.clone(),
            catalog: self.catalog.clone(),
        }))
    }

    fn cancel_sql(&self, session_id: &str) -> Option<String> {
        match self.database_type {
            DatabaseType::Mssql => Some(format!("KILL {}", session_id)),
            DatabaseType::Hana => Some(format!("ALTER SYSTEM CANCEL SESSION '{}'", session_id)),
        }
    }

    fn columns_sql(&self, _profile: &DatabaseProfile) -> String {
        "CATALOG COLUMNS".to_string()
    }

    fn foreign_keys_sql(&self, _profile: &DatabaseProfile) -> String {
        "CATALOG FOREIGN KEYS".to_string()
    }
}

pub struct MockConnection {
    session_id: String,
    state: Arc<MockState>,
    catalog: Vec<(String, String, String, String, bool, bool)>,
}

#[async_trait::async_trait]
impl DriverConnection for MockConnection {
    fn session_id(&self) -> Option<&str> {
        Some(&self.session_id)
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.state.failing_pings) {
            return Err(DriverError::new(DriverErrorClass::Network, "connection reset"));
        }
        Ok(())
    }

    async fn set_statement_timeout(&mut self, timeout_ms: u64) -> Result<bool, DriverError> {
        self.state
            .statements
            .lock()
            .unwrap()
            .push(format!("SET LOCK_TIMEOUT {}", timeout_ms));
        if take_one(&self.state.hanging_directives) {
            futures::future::pending::<()>().await;
        }
        Ok(true)
    }

    async fn query(
        &mut self,
        sql: &str,
        _params: &[QueryParam],
        max_rows: Option<usize>,
    ) -> Result<RowSet, DriverError> {
        self.state.statements.lock().unwrap().push(sql.to_string());

        if sql == "CATALOG COLUMNS" {
            return Ok(RowSet {
                columns: Vec::new(),
                rows: self
                    .catalog
                    .iter()
                    .map(|(s, t, c, d, n, p)| {
                        vec![json!(s), json!(t), json!(c), json!(d), json!(*n as i32), json!(*p as i32)]
                    })
                    .collect(),
                has_more: false,
            });
        }
        if sql == "CATALOG FOREIGN KEYS" || sql.starts_with("KILL") || sql.starts_with("ALTER SYSTEM") {
            return Ok(rows(0));
        }

        let step = self.state.script.lock().unwrap().pop_front();
        let mut result = match step.unwrap_or(Step::Rows(1)) {
            Step::Rows(n) => rows(n),
            Step::Fail(err) => return Err(err),
            Step::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            Step::Delay(delay, n) => {
                tokio::time::sleep(delay).await;
                rows(n)
            }
        };
        if let Some(limit) = max_rows {
            if result.rows.len() > limit {
                result.rows.truncate(limit);
                result.has_more = true;
            }
        }
        Ok(result)
    }

    async fn close(&mut self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}
