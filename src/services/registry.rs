// Connector Registry
//
// Owns the shared services (pools, tracker, translator, schema cache) and one
// connector per backend kind. Collaborators address databases by profile id.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    ConnectionTest, DatabaseProfile, DatabaseType, QueryParam, QueryRequest, QueryResult,
    SchemaSnapshot, ValidationLevel, ValidationVerdict,
};
use crate::services::connection_pool::{ConnectionPoolManager, PoolStatus};
use crate::services::database::{create_driver, Connector, DatabaseDriver};
use crate::services::dialect::{DialectRuleSet, DialectTranslationService};
use crate::services::query_tracker::{ActiveQuery, QueryTracker};
use crate::services::schema_cache::SchemaCache;
use crate::validation::{PerformanceAdvisor, QueryValidator};

pub struct ConnectorRegistry {
    profiles: RwLock<HashMap<String, Arc<DatabaseProfile>>>,
    connectors: HashMap<DatabaseType, Connector>,
    pools: Arc<ConnectionPoolManager>,
    tracker: QueryTracker,
    translator: Arc<DialectTranslationService>,
    validator: QueryValidator,
    schema_cache: Arc<SchemaCache>,
}

impl ConnectorRegistry {
    /// Build a registry with the production drivers and every configured profile.
    pub fn new(config: &Config) -> CoreResult<Self> {
        let drivers = DatabaseType::ALL.iter().map(|t| create_driver(*t)).collect();
        Self::with_drivers(config, drivers)
    }

    pub fn with_drivers(config: &Config, drivers: Vec<Arc<dyn DatabaseDriver>>) -> CoreResult<Self> {
        let pools = Arc::new(ConnectionPoolManager::with_config(config.pool.clone()));
        let tracker = QueryTracker::new();
        let translator = Arc::new(DialectTranslationService::with_cache(Arc::new(
            DialectRuleSet::new(),
        )));
        let advisor = PerformanceAdvisor::new(config.validation.clone());
        let schema_cache = Arc::new(SchemaCache::new(config.schema_cache.ttl()));

        let connectors = drivers
            .into_iter()
            .map(|driver| {
                let db_type = driver.database_type();
                let connector = Connector::new(driver, pools.clone(), tracker.clone())
                    .with_execution(config.execution.clone())
                    .with_translator(translator.clone())
                    .with_advisor(advisor.clone())
                    .with_schema_cache(schema_cache.clone());
                (db_type, connector)
            })
            .collect();

        let registry = Self {
            profiles: RwLock::new(HashMap::new()),
            connectors,
            pools,
            tracker,
            translator,
            validator: QueryValidator::new(advisor),
            schema_cache,
        };

        for profile in config.database_profiles()? {
            registry.register_profile(profile);
        }

        Ok(registry)
    }

    /// Add or replace a profile. Replacing does not touch an existing pool;
    /// call `remove_profile` first to drop it.
    pub fn register_profile(&self, profile: DatabaseProfile) -> Arc<DatabaseProfile> {
        tracing::info!(
            "Registered profile '{}' ({} at {})",
            profile.id,
            profile.database_type,
            profile.masked_target()
        );
        let profile = Arc::new(profile);
        self.profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile.id.clone(), profile.clone());
        profile
    }

    pub async fn remove_profile(&self, profile_id: &str) -> bool {
        let removed = self
            .profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(profile_id)
            .is_some();
        if removed {
            self.pools.remove_pool(profile_id).await;
            self.schema_cache.invalidate(profile_id);
        }
        removed
    }

    pub fn profile(&self, profile_id: &str) -> CoreResult<Arc<DatabaseProfile>> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(profile_id)
            .cloned()
            .ok_or_else(|| CoreError::PermanentBackend {
                message: format!("Unknown database profile '{}'", profile_id),
                code: None,
            })
    }

    pub fn profile_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn connector(&self, db_type: DatabaseType) -> CoreResult<&Connector> {
        self.connectors
            .get(&db_type)
            .ok_or_else(|| CoreError::PermanentBackend {
                message: format!("No driver registered for {}", db_type.display_name()),
                code: None,
            })
    }

    fn resolve(&self, profile_id: &str) -> CoreResult<(Arc<DatabaseProfile>, &Connector)> {
        let profile = self.profile(profile_id)?;
        let connector = self.connector(profile.database_type)?;
        Ok((profile, connector))
    }

    pub async fn execute_query(
        &self,
        profile_id: &str,
        sql: &str,
        params: Vec<QueryParam>,
        timeout: Duration,
        max_rows: usize,
    ) -> CoreResult<QueryResult> {
        let (profile, connector) = self.resolve(profile_id)?;
        connector
            .execute_query(&profile, sql, params, timeout, max_rows)
            .await
    }

    pub async fn execute(&self, profile_id: &str, request: QueryRequest) -> CoreResult<QueryResult> {
        let (profile, connector) = self.resolve(profile_id)?;
        connector.execute(&profile, request).await
    }

    /// `false` when the query is not running (unknown or already finished).
    pub async fn cancel_query(&self, query_id: &Uuid) -> bool {
        let db_type = match self.tracker.get(query_id) {
            Some(handle) => handle.database_type,
            None => return false,
        };
        match self.connectors.get(&db_type) {
            Some(connector) => connector.cancel_query(query_id).await,
            None => false,
        }
    }

    pub async fn test_connection(&self, profile_id: &str) -> CoreResult<ConnectionTest> {
        let (profile, connector) = self.resolve(profile_id)?;
        Ok(connector.test_connection(&profile).await)
    }

    /// Test every registered profile, in id order.
    pub async fn test_all(&self) -> Vec<(String, ConnectionTest)> {
        let mut results = Vec::new();
        for profile_id in self.profile_ids() {
            if let Ok(test) = self.test_connection(&profile_id).await {
                results.push((profile_id, test));
            }
        }
        results
    }

    pub async fn get_schema(&self, profile_id: &str) -> CoreResult<Arc<SchemaSnapshot>> {
        let (profile, connector) = self.resolve(profile_id)?;
        connector.get_schema(&profile).await
    }

    pub fn invalidate_schema(&self, profile_id: &str) -> bool {
        self.schema_cache.invalidate(profile_id)
    }

    pub fn validate_query(
        &self,
        sql: &str,
        schema: Option<&SchemaSnapshot>,
        level: ValidationLevel,
    ) -> ValidationVerdict {
        self.validator.validate_query(sql, schema, level)
    }

    pub fn optimize_query(
        &self,
        sql: &str,
        dialect: DatabaseType,
        schema: Option<&SchemaSnapshot>,
    ) -> (String, Vec<String>) {
        self.validator.advisor().optimize(sql, dialect, schema)
    }

    pub async fn translate(
        &self,
        sql: &str,
        from: DatabaseType,
        to: DatabaseType,
    ) -> CoreResult<String> {
        self.translator.translate(sql, from, to).await
    }

    pub fn active_queries(&self) -> Vec<ActiveQuery> {
        self.tracker.active()
    }

    pub async fn pool_status(&self, profile_id: &str) -> Option<PoolStatus> {
        self.pools.get_pool_status(profile_id).await
    }

    /// Close every pool and drop cached state. Running queries keep their
    /// connections until they finish.
    pub async fn shutdown(&self) {
        self.pools.close_all().await;
        self.schema_cache.clear();
        self.translator.clear_cache().await;
        tracing::info!("Connector registry shut down");
    }
}
