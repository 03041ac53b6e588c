// Dialect Translation Service
//
// Front door for dialect translation. Wraps the shared rule table and keeps an
// optional cache of finished translations.

use std::collections::HashMap;
use std::sync::Arc;

use super::rules::DialectRuleSet;
use crate::error::CoreResult;
use crate::models::DatabaseType;

type CacheKey = (String, DatabaseType, DatabaseType);

/// Service for translating queries between MSSQL and HANA.
///
/// # Example
/// ```rust,ignore
/// let service = DialectTranslationService::with_cache(Arc::new(DialectRuleSet::new()));
/// let hana = service
///     .translate("SELECT TOP 10 * FROM Products ORDER BY Price DESC", DatabaseType::Mssql, DatabaseType::Hana)
///     .await?;
/// // Result: "SELECT * FROM Products ORDER BY Price DESC LIMIT 10"
/// ```
pub struct DialectTranslationService {
    rules: Arc<DialectRuleSet>,
    cache: Option<Arc<tokio::sync::RwLock<HashMap<CacheKey, String>>>>,
    max_cached: usize,
}

impl DialectTranslationService {
    pub fn new(rules: Arc<DialectRuleSet>) -> Self {
        Self {
            rules,
            cache: None,
            max_cached: 1024,
        }
    }

    /// Create a new translation service with caching enabled
    pub fn with_cache(rules: Arc<DialectRuleSet>) -> Self {
        let mut service = Self::new(rules);
        service.cache = Some(Arc::new(tokio::sync::RwLock::new(HashMap::new())));
        service
    }

    pub fn rules(&self) -> &DialectRuleSet {
        &self.rules
    }

    /// Translate `sql` from `source` to `target`.
    ///
    /// Only successful translations are cached; refusals are recomputed.
    pub async fn translate(
        &self,
        sql: &str,
        source: DatabaseType,
        target: DatabaseType,
    ) -> CoreResult<String> {
        let cache_key = (sql.to_string(), source, target);

        if let Some(cache) = &self.cache {
            let cache_read = cache.read().await;
            if let Some(cached) = cache_read.get(&cache_key) {
                tracing::debug!(
                    "Cache hit for translation {} -> {}",
                    source.as_str(),
                    target.as_str()
                );
                return Ok(cached.clone());
            }
        }

        let translated = self.rules.translate(sql, source, target)?;

        if let Some(cache) = &self.cache {
            let mut cache_write = cache.write().await;
            if cache_write.len() >= self.max_cached {
                cache_write.clear();
                tracing::debug!("Translation cache full, cleared");
            }
            cache_write.insert(cache_key, translated.clone());
        }

        Ok(translated)
    }

    pub async fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.write().await.clear();
            tracing::info!("Translation cache cleared");
        }
    }

    /// Number of cached translations, if caching is enabled.
    pub async fn cache_size(&self) -> Option<usize> {
        match &self.cache {
            Some(cache) => Some(cache.read().await.len()),
            None => None,
        }
    }
}
