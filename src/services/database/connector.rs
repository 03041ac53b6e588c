// Connector
//
// Executes queries against one backend kind: validation gate, optional
// translation and rewrite, pooled execution with retry, timeout and
// cancellation, and catalog reads for schema snapshots.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::driver::{DatabaseDriver, DriverError};
use crate::config::ExecutionConfig;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::models::{
    Column, ConnectionTest, DatabaseProfile, DatabaseType, ForeignKey, QueryParam, QueryRequest,
    QueryResult, QueryStatus, RowSet, SchemaSnapshot,
};
use crate::services::connection_pool::{ConnectionPoolManager, PooledConnection};
use crate::services::dialect::{DialectRuleSet, DialectTranslationService};
use crate::services::query_tracker::{QueryHandle, QueryTracker};
use crate::services::schema_cache::SchemaCache;
use crate::validation::{PerformanceAdvisor, SafetyValidator};

/// How one driver call ended, before the outcome is claimed.
enum Outcome {
    Rows(RowSet),
    Failed(DriverError),
    TimedOut,
    Cancelled,
}

pub struct Connector {
    driver: Arc<dyn DatabaseDriver>,
    pools: Arc<ConnectionPoolManager>,
    tracker: QueryTracker,
    translator: Arc<DialectTranslationService>,
    advisor: PerformanceAdvisor,
    schema_cache: Arc<SchemaCache>,
    execution: ExecutionConfig,
}

impl Connector {
    pub fn new(
        driver: Arc<dyn DatabaseDriver>,
        pools: Arc<ConnectionPoolManager>,
        tracker: QueryTracker,
    ) -> Self {
        Self {
            driver,
            pools,
            tracker,
            translator: Arc::new(DialectTranslationService::new(Arc::new(DialectRuleSet::new()))),
            advisor: PerformanceAdvisor::default(),
            schema_cache: Arc::new(SchemaCache::default()),
            execution: ExecutionConfig::default(),
        }
    }

    pub fn with_execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_translator(mut self, translator: Arc<DialectTranslationService>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_advisor(mut self, advisor: PerformanceAdvisor) -> Self {
        self.advisor = advisor;
        self
    }

    pub fn with_schema_cache(mut self, schema_cache: Arc<SchemaCache>) -> Self {
        self.schema_cache = schema_cache;
        self
    }

    pub fn database_type(&self) -> DatabaseType {
        self.driver.database_type()
    }

    /// Execute `sql` with the given bind parameters, deadline and row cap.
    pub async fn execute_query(
        &self,
        profile: &Arc<DatabaseProfile>,
        sql: &str,
        params: Vec<QueryParam>,
        timeout: Duration,
        max_rows: usize,
    ) -> CoreResult<QueryResult> {
        let request = QueryRequest::new(sql)
            .with_params(params)
            .with_timeout(timeout)
            .with_max_rows(max_rows);
        self.execute(profile, request).await
    }

    /// Execute a full request.
    ///
    /// Rejected queries never touch the network. Transient backend failures
    /// are retried on a fresh connection with exponential backoff, everything
    /// else is returned after the first attempt.
    pub async fn execute(
        &self,
        profile: &Arc<DatabaseProfile>,
        request: QueryRequest,
    ) -> CoreResult<QueryResult> {
        if let Err(err) = SafetyValidator::check(&request.sql) {
            tracing::warn!("Rejected query for '{}': {}", profile.id, err);
            return Err(err);
        }

        let sql = self.prepare_sql(profile, &request).await?;
        let timeout = request.timeout.unwrap_or_else(|| self.execution.timeout());
        let max_rows = request.max_rows.unwrap_or(self.execution.max_rows);
        let max_attempts = self.execution.max_retries.max(1);

        let mut attempt = 1;
        loop {
            match self
                .execute_once(profile, &sql, &request.params, timeout, max_rows, attempt)
                .await
            {
                Ok(result) => return Ok(result),
                Err(CoreError::TransientBackend { message, .. }) if attempt < max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        "Transient failure on '{}' (attempt {}/{}), retrying in {} ms: {}",
                        profile.id,
                        attempt,
                        max_attempts,
                        delay.as_millis(),
                        message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    match err.kind() {
                        ErrorKind::PermanentBackendError => {
                            tracing::error!("Query on '{}' failed: {}", profile.id, err)
                        }
                        ErrorKind::TransientBackendError => {
                            tracing::warn!("Giving up on '{}': {}", profile.id, err)
                        }
                        _ => {}
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Translate and optionally rewrite the request's SQL for this backend.
    async fn prepare_sql(
        &self,
        profile: &DatabaseProfile,
        request: &QueryRequest,
    ) -> CoreResult<String> {
        let target = self.database_type();
        let mut sql = request.sql.clone();

        if let Some(source) = request.source_dialect.filter(|source| *source != target) {
            sql = self.translator.translate(&sql, source, target).await?;
            tracing::info!("Translated query from {} to {}: {}", source, target, sql);
            SafetyValidator::check(&sql)?;
        }

        if request.optimize {
            let schema = self.schema_cache.peek(&profile.id);
            let (optimized, notes) = self.advisor.optimize(&sql, target, schema.as_deref());
            for note in &notes {
                tracing::debug!("Optimizer: {}", note);
            }
            sql = optimized;
        }

        Ok(sql)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
        let delay = self.execution.retry_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.execution.retry_backoff_max_ms))
    }

    async fn execute_once(
        &self,
        profile: &Arc<DatabaseProfile>,
        sql: &str,
        params: &[QueryParam],
        timeout: Duration,
        max_rows: usize,
        attempt: u32,
    ) -> CoreResult<QueryResult> {
        let mut conn = self
            .pools
            .acquire(profile, &self.driver, self.pools.config().acquire_timeout())
            .await
            .map_err(|err| with_attempts(err, attempt))?;

        let registration = self.tracker.register(
            &profile.id,
            self.database_type(),
            conn.session_id().map(str::to_string),
        );
        let handle = registration.handle().clone();
        handle.transition(QueryStatus::Executing);
        let started = Instant::now();

        tracing::debug!(
            "Query {} on session {:?}, last validated {} ms ago",
            handle.query_id,
            handle.session_id,
            conn.last_validated().elapsed().as_millis()
        );

        // the timeout directive is a round trip too, so it shares the deadline
        let timeout_ms = timeout.as_millis() as u64;
        let call = async {
            conn.set_statement_timeout(timeout_ms).await?;
            conn.query(sql, params, Some(max_rows)).await
        };
        let outcome = tokio::select! {
            biased;
            _ = handle.cancel_token().cancelled() => Outcome::Cancelled,
            res = tokio::time::timeout(timeout, call) => match res {
                Ok(Ok(rows)) => Outcome::Rows(rows),
                Ok(Err(err)) => Outcome::Failed(err),
                Err(_) => Outcome::TimedOut,
            },
        };

        self.finish(&handle, conn, outcome, sql, started, timeout_ms, attempt)
            .await
    }

    /// Settle the outcome exactly once. Whoever claims the handle first owns
    /// it; a lost claim means a cancellation got there first.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        handle: &QueryHandle,
        conn: PooledConnection,
        outcome: Outcome,
        sql: &str,
        started: Instant,
        timeout_ms: u64,
        attempt: u32,
    ) -> CoreResult<QueryResult> {
        let cancelled = || CoreError::QueryCancelled {
            query_id: handle.query_id.to_string(),
        };

        if matches!(outcome, Outcome::Cancelled) || !handle.claim() {
            handle.transition(QueryStatus::Cancelled);
            self.pools.invalidate(conn).await;
            tracing::info!("Query {} cancelled", handle.query_id);
            return Err(cancelled());
        }

        match outcome {
            Outcome::Rows(rows) => {
                handle.transition(QueryStatus::Completed);
                self.pools.release(conn);
                let elapsed = started.elapsed().as_millis() as u64;
                let result = QueryResult::from_row_set(handle.query_id, rows, sql.to_string(), elapsed);
                tracing::info!(
                    "Query {} completed on '{}': {} rows in {} ms{}",
                    handle.query_id,
                    handle.profile_id,
                    result.row_count,
                    elapsed,
                    if result.truncated { " (truncated)" } else { "" }
                );
                Ok(result)
            }
            Outcome::TimedOut => {
                handle.transition(QueryStatus::TimedOut);
                self.pools.invalidate(conn).await;
                tracing::warn!("Query {} timed out after {} ms", handle.query_id, timeout_ms);
                Err(CoreError::QueryTimeout { timeout_ms })
            }
            Outcome::Failed(err) => {
                handle.transition(QueryStatus::Failed);
                self.pools.invalidate(conn).await;
                let err = if self.driver.is_transient_error(&err) {
                    CoreError::TransientBackend {
                        message: err.message,
                        code: err.code,
                        attempts: attempt,
                    }
                } else {
                    CoreError::PermanentBackend {
                        message: err.message,
                        code: err.code,
                    }
                };
                Err(err)
            }
            Outcome::Cancelled => Err(cancelled()),
        }
    }

    /// Request cancellation of a running query.
    ///
    /// Returns `false` when the query is unknown or already finished. When
    /// the backend has a native cancel statement it is sent on a separate
    /// session; the executor aborts its call and discards the connection
    /// either way.
    pub async fn cancel_query(&self, query_id: &Uuid) -> bool {
        let handle = match self.tracker.request_cancel(query_id) {
            Some(handle) => handle,
            None => return false,
        };
        tracing::info!("Cancellation requested for query {}", query_id);

        let cancel_sql = handle
            .session_id
            .as_deref()
            .and_then(|session| self.driver.cancel_sql(session));
        if let Some(cancel_sql) = cancel_sql {
            match self.pools.profile(&handle.profile_id).await {
                Some(profile) => self.send_native_cancel(&profile, &cancel_sql).await,
                None => tracing::warn!(
                    "No pool for '{}', skipping server-side cancel",
                    handle.profile_id
                ),
            }
        }
        true
    }

    async fn send_native_cancel(&self, profile: &DatabaseProfile, cancel_sql: &str) {
        let timeout = self.pools.config().ping_timeout();
        let result = tokio::time::timeout(timeout, async {
            let mut conn = self.driver.connect(profile).await?;
            let outcome = conn.query(cancel_sql, &[], None).await;
            conn.close().await;
            outcome.map(|_| ())
        })
        .await;

        match result {
            Ok(Ok(())) => tracing::debug!("Sent '{}' to '{}'", cancel_sql, profile.id),
            Ok(Err(err)) => tracing::warn!("Server-side cancel on '{}' failed: {}", profile.id, err),
            Err(_) => tracing::warn!("Server-side cancel on '{}' timed out", profile.id),
        }
    }

    /// Open a fresh session, ping it and close it. Never fails; the outcome
    /// is reported in the returned value.
    pub async fn test_connection(&self, profile: &DatabaseProfile) -> ConnectionTest {
        let started = Instant::now();
        let timeout = self.pools.config().acquire_timeout();

        let result = tokio::time::timeout(timeout, async {
            let mut conn = self.driver.connect(profile).await?;
            let pinged = conn.ping().await;
            conn.close().await;
            pinged
        })
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (ok, message) = match result {
            Ok(Ok(())) => (
                true,
                format!(
                    "Connected to {} at {}",
                    profile.database_type.display_name(),
                    profile.masked_target()
                ),
            ),
            Ok(Err(err)) => (false, format!("Connection failed: {}", err)),
            Err(_) => (
                false,
                format!("Connection attempt timed out after {} ms", timeout.as_millis()),
            ),
        };

        if ok {
            tracing::info!("Connection test for '{}' succeeded in {} ms", profile.id, latency_ms);
        } else {
            tracing::warn!("Connection test for '{}' failed: {}", profile.id, message);
        }

        ConnectionTest {
            ok,
            message,
            latency_ms,
        }
    }

    /// Catalog snapshot for `profile`, served from cache while fresh.
    pub async fn get_schema(&self, profile: &Arc<DatabaseProfile>) -> CoreResult<Arc<SchemaSnapshot>> {
        if let Some(snapshot) = self.schema_cache.get(&profile.id) {
            return Ok(snapshot);
        }

        let mut conn = self
            .pools
            .acquire(profile, &self.driver, self.pools.config().acquire_timeout())
            .await?;
        let timeout = self.execution.timeout();
        let columns_sql = self.driver.columns_sql(profile);
        let foreign_keys_sql = self.driver.foreign_keys_sql(profile);

        let fetched = tokio::time::timeout(timeout, async {
            let columns = conn.query(&columns_sql, &[], None).await?;
            let foreign_keys = conn.query(&foreign_keys_sql, &[], None).await?;
            Ok::<_, DriverError>((columns, foreign_keys))
        })
        .await;

        let (columns, foreign_keys) = match fetched {
            Ok(Ok(rows)) => {
                self.pools.release(conn);
                rows
            }
            Ok(Err(err)) => {
                self.pools.invalidate(conn).await;
                return Err(err.into_core(1));
            }
            Err(_) => {
                self.pools.invalidate(conn).await;
                return Err(CoreError::QueryTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        let snapshot = build_snapshot(columns, foreign_keys);
        tracing::info!(
            "Loaded schema for '{}': {} tables",
            profile.id,
            snapshot.tables().count()
        );
        Ok(self.schema_cache.put(&profile.id, snapshot))
    }

    pub fn invalidate_schema(&self, profile_id: &str) -> bool {
        self.schema_cache.invalidate(profile_id)
    }
}

fn with_attempts(err: CoreError, attempts: u32) -> CoreError {
    match err {
        CoreError::TransientBackend { message, code, .. } => CoreError::TransientBackend {
            message,
            code,
            attempts,
        },
        other => other,
    }
}

fn text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Catalog flags arrive as 0/1, booleans or 'YES'/'TRUE' depending on backend.
fn flag(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_i64().map_or(false, |n| n != 0),
        serde_json::Value::String(s) => {
            matches!(s.trim().to_uppercase().as_str(), "1" | "Y" | "YES" | "TRUE")
        }
        _ => false,
    }
}

/// Assemble a snapshot from catalog rows.
///
/// Column rows are (schema, table, column, type, nullable, primary key);
/// foreign key rows are (schema, table, column, referenced table, referenced column).
fn build_snapshot(columns: RowSet, foreign_keys: RowSet) -> SchemaSnapshot {
    let mut snapshot = SchemaSnapshot::default();

    for row in columns.rows.iter().filter(|row| row.len() >= 6) {
        let table = snapshot.table_entry(&text(&row[0]), &text(&row[1]));
        let mut column = Column::new(text(&row[2]), text(&row[3]));
        column.is_nullable = flag(&row[4]);
        if flag(&row[5]) {
            table.primary_key.push(column.name.clone());
        }
        table.columns.push(column);
    }

    for row in foreign_keys.rows.iter().filter(|row| row.len() >= 5) {
        let table = snapshot.table_entry(&text(&row[0]), &text(&row[1]));
        table.foreign_keys.push(ForeignKey {
            column: text(&row[2]),
            referenced_table: text(&row[3]),
            referenced_column: text(&row[4]),
        });
    }

    snapshot.retrieved_at = Some(Utc::now());
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::services::database::testing::{profile, MockDriver, Step};
    use crate::services::database::DriverErrorClass;
    use std::sync::atomic::Ordering;

    struct Fixture {
        connector: Arc<Connector>,
        mock: Arc<MockDriver>,
        profile: Arc<DatabaseProfile>,
        tracker: QueryTracker,
    }

    fn fixture_with(mock: MockDriver, pool_size: usize) -> Fixture {
        let database_type = mock.database_type();
        let mock = Arc::new(mock);
        let tracker = QueryTracker::new();
        let pools = Arc::new(ConnectionPoolManager::with_config(PoolConfig {
            acquire_timeout_secs: 1,
            ..PoolConfig::default()
        }));
        let execution = ExecutionConfig {
            retry_backoff_ms: 1,
            retry_backoff_max_ms: 5,
            ..ExecutionConfig::default()
        };
        let connector = Connector::new(mock.clone(), pools, tracker.clone()).with_execution(execution);
        Fixture {
            connector: Arc::new(connector),
            mock,
            profile: Arc::new(profile(database_type, pool_size)),
            tracker,
        }
    }

    fn fixture(database_type: DatabaseType) -> Fixture {
        fixture_with(MockDriver::new(database_type), 2)
    }

    #[tokio::test]
    async fn test_invalid_query_does_no_io() {
        let f = fixture(DatabaseType::Mssql);
        let err = f
            .connector
            .execute_query(&f.profile, "DELETE FROM Orders", vec![], Duration::from_secs(1), 10)
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::InvalidQuery { .. }));
        assert_eq!(f.mock.state.connects.load(Ordering::SeqCst), 0);
        assert!(f.mock.state.statements().is_empty());
    }

    #[tokio::test]
    async fn test_execute_truncates_at_max_rows() {
        let f = fixture(DatabaseType::Mssql);
        f.mock.script(vec![Step::Rows(5)]);

        let result = f
            .connector
            .execute_query(&f.profile, "SELECT id, name FROM Orders WHERE x = 1", vec![], Duration::from_secs(5), 3)
            .await
            .unwrap();

        assert_eq!(result.row_count, 3);
        assert!(result.truncated);
        assert_eq!(result.columns.len(), 2);
        assert!(f.mock.state.statements().contains(&"SET LOCK_TIMEOUT 5000".to_string()));
        assert!(f.tracker.is_empty());

        let status = f.connector.pools.get_pool_status("test").await.unwrap();
        assert_eq!(status.available, 1);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_on_fresh_connection() {
        let f = fixture(DatabaseType::Mssql);
        f.mock.script(vec![
            Step::Fail(DriverError::new(DriverErrorClass::Deadlock, "deadlock victim").with_code(1205)),
            Step::Rows(2),
        ]);

        let result = f
            .connector
            .execute(&f.profile, QueryRequest::new("SELECT * FROM Orders WHERE x = 1"))
            .await
            .unwrap();

        assert_eq!(result.row_count, 2);
        assert_eq!(f.mock.state.connects.load(Ordering::SeqCst), 2);
        assert_eq!(f.mock.state.closes.load(Ordering::SeqCst), 1);
        assert_eq!(f.mock.state.user_statements().len(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let f = fixture(DatabaseType::Hana);
        let reset = DriverError::new(DriverErrorClass::Network, "connection reset by peer");
        f.mock.script(vec![
            Step::Fail(reset.clone()),
            Step::Fail(reset.clone()),
            Step::Fail(reset.clone()),
            Step::Rows(1),
        ]);

        let err = f
            .connector
            .execute(&f.profile, QueryRequest::new("SELECT * FROM Orders WHERE x = 1"))
            .await
            .unwrap_err();

        match err {
            CoreError::TransientBackend { attempts, message, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(message, "connection reset by peer");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(f.mock.state.user_statements().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_surfaces_immediately() {
        let f = fixture(DatabaseType::Mssql);
        f.mock.script(vec![Step::Fail(
            DriverError::new(DriverErrorClass::Syntax, "Invalid object name 'Ordrs'").with_code(208),
        )]);

        let err = f
            .connector
            .execute(&f.profile, QueryRequest::new("SELECT * FROM Ordrs WHERE x = 1"))
            .await
            .unwrap_err();

        match err {
            CoreError::PermanentBackend { message, code } => {
                assert_eq!(message, "Invalid object name 'Ordrs'");
                assert_eq!(code, Some(208));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(f.mock.state.user_statements().len(), 1);
        assert_eq!(f.mock.state.closes.load(Ordering::SeqCst), 1);
        assert!(f.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_invalidates_connection() {
        let f = fixture(DatabaseType::Hana);
        f.mock.script(vec![Step::Hang]);

        let err = f
            .connector
            .execute(
                &f.profile,
                QueryRequest::new("SELECT * FROM Orders WHERE x = 1").with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::QueryTimeout { timeout_ms: 50 }));
        assert_eq!(f.mock.state.closes.load(Ordering::SeqCst), 1);
        assert!(f.tracker.is_empty());

        // the slot is free again
        let result = f
            .connector
            .execute(&f.profile, QueryRequest::new("SELECT * FROM Orders WHERE x = 1"))
            .await
            .unwrap();
        assert_eq!(result.row_count, 1);
    }

    #[tokio::test]
    async fn test_stalled_timeout_directive_respects_deadline() {
        let f = fixture(DatabaseType::Mssql);
        f.mock.hang_next_directives(1);

        let request = QueryRequest::new("SELECT * FROM Orders WHERE x = 1").with_timeout(Duration::from_millis(50));
        let err = tokio::time::timeout(Duration::from_secs(2), f.connector.execute(&f.profile, request))
            .await
            .expect("deadline must cover the timeout directive")
            .unwrap_err();

        assert!(matches!(err, CoreError::QueryTimeout { timeout_ms: 50 }));
        assert!(f.mock.state.user_statements().is_empty());
        assert_eq!(f.mock.state.closes.load(Ordering::SeqCst), 1);
        assert!(f.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_slow_query_within_deadline_completes() {
        let f = fixture(DatabaseType::Hana);
        f.mock.script(vec![Step::Delay(Duration::from_millis(30), 2)]);

        let result = f
            .connector
            .execute(
                &f.profile,
                QueryRequest::new("SELECT * FROM Orders WHERE x = 1").with_timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap();

        assert_eq!(result.row_count, 2);
        assert!(result.execution_time_ms >= 30);
        assert_eq!(f.mock.state.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stalled_connect_is_retried() {
        let f = fixture(DatabaseType::Mssql);
        f.mock.hang_next_connects(1);

        let result = f
            .connector
            .execute(&f.profile, QueryRequest::new("SELECT * FROM Orders WHERE x = 1"))
            .await
            .unwrap();

        assert_eq!(result.row_count, 1);
        assert_eq!(f.mock.state.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_query() {
        let f = fixture(DatabaseType::Mssql);
        f.mock.script(vec![Step::Hang]);

        let running = {
            let connector = f.connector.clone();
            let profile = f.profile.clone();
            tokio::spawn(async move {
                connector
                    .execute(&profile, QueryRequest::new("SELECT * FROM Orders WHERE x = 1"))
                    .await
            })
        };

        let query_id = loop {
            if let Some(active) = f.tracker.active().first() {
                break active.query_id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert!(f.connector.cancel_query(&query_id).await);
        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::QueryCancelled { .. }));

        assert!(f.mock.state.statements().contains(&"KILL 1".to_string()));
        assert!(f.tracker.is_empty());
        // a second cancel finds nothing
        assert!(!f.connector.cancel_query(&query_id).await);
    }

    #[tokio::test]
    async fn test_cancel_unknown_query() {
        let f = fixture(DatabaseType::Hana);
        assert!(!f.connector.cancel_query(&Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_source_dialect_is_translated() {
        let f = fixture(DatabaseType::Hana);
        let request = QueryRequest::new("SELECT TOP 5 * FROM Products ORDER BY Price DESC")
            .written_in(DatabaseType::Mssql);

        let result = f.connector.execute(&f.profile, request).await.unwrap();
        assert!(result.executed_sql.ends_with("LIMIT 5"), "{}", result.executed_sql);
        assert!(!result.executed_sql.contains("TOP"));
        assert_eq!(f.mock.state.user_statements(), vec![result.executed_sql.clone()]);
    }

    #[tokio::test]
    async fn test_untranslatable_feature_is_refused_before_io() {
        let f = fixture(DatabaseType::Hana);
        let request = QueryRequest::new(
            "SELECT * FROM Sales PIVOT (SUM(Amount) FOR Quarter IN ([Q1], [Q2])) AS p",
        )
        .written_in(DatabaseType::Mssql);

        let err = f.connector.execute(&f.profile, request).await.unwrap_err();
        assert!(matches!(err, CoreError::UntranslatableFeature { .. }));
        assert_eq!(f.mock.state.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_optimize_adds_read_hint() {
        let f = fixture(DatabaseType::Mssql);
        let request = QueryRequest::new("SELECT id FROM Orders WHERE status = 1").optimized();

        let result = f.connector.execute(&f.profile, request).await.unwrap();
        assert!(result.executed_sql.contains("WITH (NOLOCK)"), "{}", result.executed_sql);
    }

    #[tokio::test]
    async fn test_connection_test_reports_outcome() {
        let f = fixture(DatabaseType::Mssql);
        let ok = f.connector.test_connection(&f.profile).await;
        assert!(ok.ok);
        assert!(!ok.message.contains("secret"));

        f.mock.fail_next_connects(1);
        let failed = f.connector.test_connection(&f.profile).await;
        assert!(!failed.ok);
        assert!(failed.message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_get_schema_is_cached() {
        let mock = MockDriver::new(DatabaseType::Mssql).with_catalog(vec![
            ("dbo", "Orders", "id", "int", false, true),
            ("dbo", "Orders", "customer_id", "int", true, false),
            ("dbo", "Customers", "id", "int", false, true),
        ]);
        let f = fixture_with(mock, 1);

        let snapshot = f.connector.get_schema(&f.profile).await.unwrap();
        let orders = snapshot.find_table(Some("dbo"), "Orders").unwrap();
        assert_eq!(orders.columns.len(), 2);
        assert_eq!(orders.primary_key, vec!["id".to_string()]);
        assert!(!orders.columns[0].is_nullable);
        assert!(snapshot.find_table(None, "customers").is_some());

        f.connector.get_schema(&f.profile).await.unwrap();
        let catalog_reads = || {
            f.mock
                .state
                .statements()
                .iter()
                .filter(|s| s.as_str() == "CATALOG COLUMNS")
                .count()
        };
        assert_eq!(catalog_reads(), 1);

        assert!(f.connector.invalidate_schema("test"));
        f.connector.get_schema(&f.profile).await.unwrap();
        assert_eq!(catalog_reads(), 2);
    }

    #[test]
    fn test_backoff_is_capped() {
        let f = fixture_with(MockDriver::new(DatabaseType::Mssql), 1);
        assert_eq!(f.connector.backoff(1), Duration::from_millis(1));
        assert_eq!(f.connector.backoff(2), Duration::from_millis(2));
        assert_eq!(f.connector.backoff(10), Duration::from_millis(5));
    }

    #[test]
    fn test_catalog_flags() {
        assert!(flag(&serde_json::json!(1)));
        assert!(flag(&serde_json::json!("TRUE")));
        assert!(!flag(&serde_json::json!("NO")));
        assert!(!flag(&serde_json::Value::Null));
    }
}
