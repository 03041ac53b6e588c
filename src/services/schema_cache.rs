// Schema Snapshot Cache
//
// Keeps the last catalog snapshot per database profile for a fixed TTL so
// repeated schema validation does not hit the catalog on every query.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::models::SchemaSnapshot;

#[derive(Debug, Clone)]
struct CachedSnapshot {
    snapshot: Arc<SchemaSnapshot>,
    cached_at: Instant,
}

impl CachedSnapshot {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct SchemaCache {
    entries: Mutex<HashMap<String, CachedSnapshot>>,
    stats: Mutex<CacheStats>,
    ttl: Duration,
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached snapshot for `profile_id`, or `None` on a miss or expiry.
    pub fn get(&self, profile_id: &str) -> Option<Arc<SchemaSnapshot>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.get(profile_id) {
            Some(cached) if cached.is_expired(self.ttl) => {
                entries.remove(profile_id);
                stats.misses += 1;
                stats.expirations += 1;
                tracing::debug!("Schema cache expired for '{}'", profile_id);
                None
            }
            Some(cached) => {
                stats.hits += 1;
                tracing::debug!("Schema cache hit for '{}'", profile_id);
                Some(cached.snapshot.clone())
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Like `get`, but never counts toward the statistics or evicts.
    pub fn peek(&self, profile_id: &str) -> Option<Arc<SchemaSnapshot>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(profile_id)
            .filter(|cached| !cached.is_expired(self.ttl))
            .map(|cached| cached.snapshot.clone())
    }

    pub fn put(&self, profile_id: &str, snapshot: SchemaSnapshot) -> Arc<SchemaSnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            profile_id.to_string(),
            CachedSnapshot {
                snapshot: snapshot.clone(),
                cached_at: Instant::now(),
            },
        );
        snapshot
    }

    pub fn invalidate(&self, profile_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(profile_id).is_some()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let count = entries.len();
        entries.clear();
        tracing::info!("Schema cache cleared ({} entries removed)", count);
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, Table};

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot::single(
            "dbo",
            vec![Table::new("Orders", vec![Column::new("id", "int")])],
        )
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let cache = SchemaCache::default();
        assert!(cache.get("sales").is_none());

        cache.put("sales", snapshot());
        let cached = cache.get("sales").unwrap();
        assert!(cached.find_table(None, "orders").is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_ratio(), 0.5);
    }

    #[test]
    fn test_cache_expiration() {
        let cache = SchemaCache::new(Duration::from_millis(10));
        cache.put("sales", snapshot());
        std::thread::sleep(Duration::from_millis(30));

        assert!(cache.peek("sales").is_none());
        assert!(cache.get("sales").is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = SchemaCache::default();
        cache.put("sales", snapshot());
        cache.put("erp", snapshot());

        assert!(cache.invalidate("sales"));
        assert!(!cache.invalidate("sales"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
