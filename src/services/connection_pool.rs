use deadpool::managed::{
    self, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult, TimeoutType, Timeouts,
};
use deadpool::Runtime;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::config::PoolConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::DatabaseProfile;
use crate::services::database::{DatabaseDriver, DriverConnection, DriverError, DriverErrorClass};

/// deadpool manager that opens sessions through a backend driver and
/// pings them before they are handed out again.
pub struct DriverManager {
    driver: Arc<dyn DatabaseDriver>,
    profile: Arc<DatabaseProfile>,
    max_lifetime: Duration,
    ping_timeout: Duration,
}

impl managed::Manager for DriverManager {
    type Type = Box<dyn DriverConnection>;
    type Error = DriverError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        tracing::debug!("Opening connection to {}", self.profile.masked_target());
        self.driver.connect(&self.profile).await
    }

    async fn recycle(&self, conn: &mut Self::Type, metrics: &Metrics) -> RecycleResult<Self::Error> {
        if metrics.age() > self.max_lifetime {
            return Err(RecycleError::Message(
                "connection exceeded its maximum lifetime".into(),
            ));
        }
        match tokio::time::timeout(self.ping_timeout, conn.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::debug!("Liveness check failed on '{}': {}", self.profile.id, e);
                Err(RecycleError::Backend(e))
            }
            Err(_) => Err(RecycleError::Backend(DriverError::new(
                DriverErrorClass::Timeout,
                "liveness check timed out",
            ))),
        }
    }
}

/// A checked-out connection. Dropping it returns the connection to its pool;
/// `ConnectionPoolManager::invalidate` discards it instead.
pub struct PooledConnection {
    object: Object<DriverManager>,
    profile_id: String,
    acquired_at: Instant,
}

impl PooledConnection {
    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// When the connection last passed a liveness check (or was opened).
    pub fn last_validated(&self) -> Instant {
        let metrics = Object::metrics(&self.object);
        metrics.recycled.unwrap_or(metrics.created)
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Deref for PooledConnection {
    type Target = dyn DriverConnection;

    fn deref(&self) -> &Self::Target {
        &**self.object
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.object
    }
}

struct ProfilePool {
    pool: Pool<DriverManager>,
    profile: Arc<DatabaseProfile>,
}

/// Connection pool manager that maintains one bounded pool per database profile
pub struct ConnectionPoolManager {
    pools: Arc<RwLock<HashMap<String, ProfilePool>>>,
    config: PoolConfig,
}

impl ConnectionPoolManager {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get or create the pool for `profile`.
    /// This method is safe to call concurrently from multiple tasks
    async fn get_or_create_pool(
        &self,
        profile: &Arc<DatabaseProfile>,
        driver: &Arc<dyn DatabaseDriver>,
    ) -> CoreResult<Pool<DriverManager>> {
        // Fast path: check if pool already exists (read lock)
        {
            let pools = self.pools.read().await;
            if let Some(entry) = pools.get(&profile.id) {
                return Ok(entry.pool.clone());
            }
        }

        // Slow path: create new pool (write lock)
        let mut pools = self.pools.write().await;

        // Double-check in case another task created the pool while we were waiting
        if let Some(entry) = pools.get(&profile.id) {
            return Ok(entry.pool.clone());
        }

        let max_size = profile.pool_size.unwrap_or(self.config.max_size).max(1);
        tracing::info!(
            "Creating connection pool for '{}' at {} (max_size: {})",
            profile.id,
            profile.masked_target(),
            max_size
        );

        let manager = DriverManager {
            driver: driver.clone(),
            profile: profile.clone(),
            max_lifetime: self.config.max_lifetime(),
            ping_timeout: self.config.ping_timeout(),
        };
        let pool = Pool::builder(manager)
            .max_size(max_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| {
                tracing::error!("Failed to create connection pool: {}", e);
                CoreError::PermanentBackend {
                    message: format!("Failed to create connection pool: {}", e),
                    code: None,
                }
            })?;

        pools.insert(
            profile.id.clone(),
            ProfilePool {
                pool: pool.clone(),
                profile: profile.clone(),
            },
        );

        Ok(pool)
    }

    /// Check out a connection, waiting at most `timeout`.
    ///
    /// Idle connections are pinged first; a dead one is discarded and a
    /// replacement opened inside the same wait budget.
    pub async fn acquire(
        &self,
        profile: &Arc<DatabaseProfile>,
        driver: &Arc<dyn DatabaseDriver>,
        timeout: Duration,
    ) -> CoreResult<PooledConnection> {
        let pool = self.get_or_create_pool(profile, driver).await?;
        let started = Instant::now();
        // connect must lapse inside the overall deadline to be reported as such
        let timeouts = Timeouts {
            wait: Some(timeout),
            create: Some(timeout - timeout / 10),
            recycle: Some(timeout),
        };

        let exhausted = || CoreError::PoolExhausted {
            database: profile.id.clone(),
            waited_ms: started.elapsed().as_millis() as u64,
        };

        let object = match tokio::time::timeout(timeout, pool.timeout_get(&timeouts)).await {
            Ok(Ok(object)) => object,
            Ok(Err(PoolError::Timeout(TimeoutType::Create))) => {
                tracing::warn!(
                    "Connecting to {} timed out after {} ms",
                    profile.masked_target(),
                    started.elapsed().as_millis()
                );
                let err = DriverError::new(
                    DriverErrorClass::ConnectTimeout,
                    format!(
                        "Connecting to '{}' timed out after {} ms",
                        profile.id,
                        started.elapsed().as_millis()
                    ),
                );
                return Err(err.into_core(1));
            }
            Ok(Err(PoolError::Timeout(_))) | Err(_) => {
                tracing::warn!(
                    "Connection pool for '{}' exhausted after {} ms",
                    profile.id,
                    started.elapsed().as_millis()
                );
                return Err(exhausted());
            }
            Ok(Err(PoolError::Backend(e))) => return Err(e.into_core(1)),
            Ok(Err(PoolError::Closed)) => {
                return Err(CoreError::PermanentBackend {
                    message: format!("Connection pool for '{}' is closed", profile.id),
                    code: None,
                })
            }
            Ok(Err(e)) => {
                return Err(CoreError::PermanentBackend {
                    message: e.to_string(),
                    code: None,
                })
            }
        };

        Ok(PooledConnection {
            object,
            profile_id: profile.id.clone(),
            acquired_at: Instant::now(),
        })
    }

    /// Return a healthy connection to its pool.
    pub fn release(&self, conn: PooledConnection) {
        tracing::debug!(
            "Released connection for '{}' after {} ms",
            conn.profile_id,
            conn.held_for().as_millis()
        );
        drop(conn);
    }

    /// Permanently discard a connection and free its slot.
    pub async fn invalidate(&self, conn: PooledConnection) {
        let profile_id = conn.profile_id;
        let mut raw = Object::take(conn.object);
        raw.close().await;
        tracing::debug!("Invalidated connection for '{}'", profile_id);
    }

    /// Remove a connection pool (useful when a profile is deleted)
    pub async fn remove_pool(&self, profile_id: &str) -> bool {
        let mut pools = self.pools.write().await;
        match pools.remove(profile_id) {
            Some(entry) => {
                entry.pool.close();
                tracing::info!("Removed connection pool for '{}'", profile_id);
                true
            }
            None => false,
        }
    }

    /// Get the number of active pools
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.len()
    }

    pub async fn get_pool_status(&self, profile_id: &str) -> Option<PoolStatus> {
        let pools = self.pools.read().await;
        pools.get(profile_id).map(|entry| {
            let status = entry.pool.status();
            PoolStatus {
                size: status.size,
                available: status.available,
                max_size: status.max_size,
            }
        })
    }

    pub async fn profile(&self, profile_id: &str) -> Option<Arc<DatabaseProfile>> {
        let pools = self.pools.read().await;
        pools.get(profile_id).map(|entry| entry.profile.clone())
    }

    /// Close every pool. Checked-out connections are dropped when their
    /// holders finish.
    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for (profile_id, entry) in pools.drain() {
            entry.pool.close();
            tracing::info!("Closed connection pool for '{}'", profile_id);
        }
    }
}

impl Default for ConnectionPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection pool status information
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub max_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DatabaseType;
    use crate::services::database::testing::{profile, MockDriver};
    use std::sync::atomic::Ordering;

    fn setup(pool_size: usize) -> (ConnectionPoolManager, Arc<DatabaseProfile>, Arc<MockDriver>) {
        let manager = ConnectionPoolManager::new();
        let profile = Arc::new(profile(DatabaseType::Mssql, pool_size));
        let driver = Arc::new(MockDriver::new(DatabaseType::Mssql));
        (manager, profile, driver)
    }

    #[tokio::test]
    async fn test_pool_manager_creation() {
        let manager = ConnectionPoolManager::new();
        assert_eq!(manager.pool_count().await, 0);
        assert!(!manager.remove_pool("missing").await);
        assert!(manager.get_pool_status("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_release_reuses_connection() {
        let (manager, profile, mock) = setup(2);
        let driver: Arc<dyn DatabaseDriver> = mock.clone();

        let conn = manager.acquire(&profile, &driver, Duration::from_secs(1)).await.unwrap();
        let first_session = conn.session_id().map(str::to_string);
        manager.release(conn);

        let conn = manager.acquire(&profile, &driver, Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.session_id().map(str::to_string), first_session);
        assert_eq!(mock.state.connects.load(Ordering::SeqCst), 1);
        assert_eq!(mock.state.pings.load(Ordering::SeqCst), 1);

        let status = manager.get_pool_status(&profile.id).await.unwrap();
        assert_eq!(status.max_size, 2);
        assert_eq!(status.size, 1);
    }

    #[tokio::test]
    async fn test_extra_acquire_times_out_then_succeeds_after_release() {
        let (manager, profile, mock) = setup(1);
        let driver: Arc<dyn DatabaseDriver> = mock.clone();

        let held = manager.acquire(&profile, &driver, Duration::from_secs(1)).await.unwrap();

        let err = manager
            .acquire(&profile, &driver, Duration::from_millis(50))
            .await
            .err()
            .expect("second acquire must time out");
        assert!(matches!(err, CoreError::PoolExhausted { .. }));

        let manager = Arc::new(manager);
        let waiter = {
            let manager = manager.clone();
            let profile = profile.clone();
            let driver = driver.clone();
            tokio::spawn(async move { manager.acquire(&profile, &driver, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.release(held);

        let conn = waiter.await.unwrap().unwrap();
        assert_eq!(conn.session_id(), Some("1"));
    }

    #[tokio::test]
    async fn test_failed_ping_opens_replacement() {
        let (manager, profile, mock) = setup(1);
        let driver: Arc<dyn DatabaseDriver> = mock.clone();

        let conn = manager.acquire(&profile, &driver, Duration::from_secs(1)).await.unwrap();
        manager.release(conn);

        mock.fail_next_pings(1);
        let conn = manager.acquire(&profile, &driver, Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.session_id(), Some("2"));
        assert_eq!(mock.state.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_frees_slot() {
        let (manager, profile, mock) = setup(1);
        let driver: Arc<dyn DatabaseDriver> = mock.clone();

        let conn = manager.acquire(&profile, &driver, Duration::from_secs(1)).await.unwrap();
        manager.invalidate(conn).await;
        assert_eq!(mock.state.closes.load(Ordering::SeqCst), 1);

        let conn = manager.acquire(&profile, &driver, Duration::from_millis(200)).await.unwrap();
        assert_eq!(conn.session_id(), Some("2"));
    }

    #[tokio::test]
    async fn test_expired_connections_are_recycled() {
        let mut config = PoolConfig::default();
        config.max_lifetime_secs = 0;
        let manager = ConnectionPoolManager::with_config(config);
        let profile = Arc::new(profile(DatabaseType::Hana, 1));
        let mock = Arc::new(MockDriver::new(DatabaseType::Hana));
        let driver: Arc<dyn DatabaseDriver> = mock.clone();

        let conn = manager.acquire(&profile, &driver, Duration::from_secs(1)).await.unwrap();
        manager.release(conn);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let conn = manager.acquire(&profile, &driver, Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.session_id(), Some("2"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_classified() {
        let (manager, profile, mock) = setup(1);
        let driver: Arc<dyn DatabaseDriver> = mock.clone();
        mock.fail_next_connects(1);

        let err = manager
            .acquire(&profile, &driver, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::TransientBackend { .. }));
    }

    #[tokio::test]
    async fn test_stalled_connect_is_transient() {
        let (manager, profile, mock) = setup(1);
        let driver: Arc<dyn DatabaseDriver> = mock.clone();
        mock.hang_next_connects(1);

        let err = manager
            .acquire(&profile, &driver, Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(
            matches!(&err, CoreError::TransientBackend { message, .. } if message.contains("timed out")),
            "{:?}",
            err
        );

        // the abandoned connect does not hold the only slot
        let conn = manager.acquire(&profile, &driver, Duration::from_millis(100)).await.unwrap();
        assert_eq!(conn.session_id(), Some("1"));
    }

    #[tokio::test]
    async fn test_close_all() {
        let (manager, profile, mock) = setup(1);
        let driver: Arc<dyn DatabaseDriver> = mock.clone();
        let conn = manager.acquire(&profile, &driver, Duration::from_secs(1)).await.unwrap();
        manager.release(conn);
        assert_eq!(manager.pool_count().await, 1);

        manager.close_all().await;
        assert_eq!(manager.pool_count().await, 0);
    }
}
