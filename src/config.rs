use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::error::CoreError;
use crate::models::DatabaseProfile;
use crate::validation::PerformanceThresholds;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub execution: ExecutionConfig,
    pub validation: PerformanceThresholds,
    pub schema_cache: SchemaCacheConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub profiles: Vec<ProfileSource>,
    /// Rejected environment overrides, logged once logging is up.
    #[serde(skip)]
    pub load_warnings: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Pool size for profiles that do not set their own.
    pub max_size: usize,
    pub acquire_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub ping_timeout_secs: u64,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            acquire_timeout_secs: 10,
            max_lifetime_secs: 1800,
            ping_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    pub timeout_secs: u64,
    pub max_rows: usize,
    /// Total attempts for transient failures, including the first.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_rows: 1000,
            max_retries: 3,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaCacheConfig {
    pub ttl_secs: u64,
}

impl SchemaCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

/// A configured database, either spelled out or given as a connection URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProfileSource {
    Url { id: String, url: String },
    Full(DatabaseProfile),
}

impl ProfileSource {
    pub fn into_profile(self) -> Result<DatabaseProfile, CoreError> {
        match self {
            ProfileSource::Url { id, url } => DatabaseProfile::from_url(id, &url),
            ProfileSource::Full(profile) => Ok(profile),
        }
    }
}

fn parse_override(name: &str, value: &str) -> Result<i64, String> {
    match value.trim().parse::<i64>() {
        Ok(n) if n >= 0 => Ok(n),
        _ => Err(format!("Ignoring {}={:?}: not a non-negative integer", name, value)),
    }
}

impl Config {
    /// Built-in defaults for every setting.
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("pool.max_size", 5)?
            .set_default("pool.acquire_timeout_secs", 10)?
            .set_default("pool.max_lifetime_secs", 1800)?
            .set_default("pool.ping_timeout_secs", 5)?
            .set_default("execution.timeout_secs", 30)?
            .set_default("execution.max_rows", 1000)?
            .set_default("execution.max_retries", 3)?
            .set_default("execution.retry_backoff_ms", 100)?
            .set_default("execution.retry_backoff_max_ms", 2000)?
            .set_default("validation.max_or_conditions", 5)?
            .set_default("validation.max_joins", 5)?
            .set_default("validation.max_group_by_columns", 5)?
            .set_default("validation.default_row_cap", 1000)?
            .set_default("schema_cache.ttl_secs", 300)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, config::ConfigError> {
        builder.build()?.try_deserialize()
    }

    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = Self::defaults()?;

        if let Ok(path) = env::var("DB_CORE_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }

        let numeric_overrides = [
            ("POOL_MAX_SIZE", "pool.max_size"),
            ("POOL_ACQUIRE_TIMEOUT_SECS", "pool.acquire_timeout_secs"),
            ("POOL_MAX_LIFETIME_SECS", "pool.max_lifetime_secs"),
            ("QUERY_TIMEOUT_SECS", "execution.timeout_secs"),
            ("QUERY_MAX_ROWS", "execution.max_rows"),
            ("QUERY_MAX_RETRIES", "execution.max_retries"),
            ("SCHEMA_CACHE_TTL_SECS", "schema_cache.ttl_secs"),
        ];
        let mut warnings = Vec::new();
        for (var, key) in numeric_overrides {
            let Ok(raw) = env::var(var) else {
                continue;
            };
            match parse_override(var, &raw) {
                Ok(value) => builder = builder.set_override(key, value)?,
                Err(warning) => warnings.push(warning),
            }
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        let mut config = Self::from_builder(builder)?;
        config.load_warnings = warnings;

        // a single DATABASE_URL is enough for one-off use
        if let Ok(url) = env::var("DATABASE_URL") {
            config.profiles.push(ProfileSource::Url {
                id: "default".to_string(),
                url,
            });
        }

        Ok(config)
    }

    /// Resolve every configured profile. Fails on the first malformed entry.
    pub fn database_profiles(&self) -> Result<Vec<DatabaseProfile>, CoreError> {
        self.profiles
            .iter()
            .cloned()
            .map(ProfileSource::into_profile)
            .collect()
    }
}
