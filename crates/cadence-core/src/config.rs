use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 2222;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PERSIST_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_STATS_RETENTION: usize = 100;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Which `JobDb` implementation backs the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseBackend {
    /// Single-file SQLite store (default).
    #[default]
    Sqlite,
    /// Process-local store; everything is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseBackend,
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            path: default_db_path(),
        }
    }
}

/// In-memory job map behind the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheKind {
    /// Single reader/writer lock around a `HashMap`.
    Locked,
    /// Sorted-list + atomic skip-index map; readers never lock.
    #[default]
    LockFree,
}

/// When cached jobs reach the `JobDb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistencePolicy {
    /// Every set/delete writes through before returning.
    Transactional,
    /// A background sweep saves every cached job each interval.
    #[default]
    Periodic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub kind: CacheKind,
    #[serde(default)]
    pub persistence: PersistencePolicy,
    /// Seconds between periodic persistence sweeps.
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,
    /// Number of run records retained per job.
    #[serde(default = "default_stats_retention")]
    pub stats_retention: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::default(),
            persistence: PersistencePolicy::default(),
            persist_interval_secs: DEFAULT_PERSIST_INTERVAL_SECS,
            stats_retention: DEFAULT_STATS_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Applied to remote jobs that leave `timeout_secs` at 0.
    #[serde(default = "default_http_timeout")]
    pub default_http_timeout_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_persist_interval() -> u64 {
    DEFAULT_PERSIST_INTERVAL_SECS
}
fn default_stats_retention() -> usize {
    DEFAULT_STATS_RETENTION
}
fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore so field names keep theirs:
    /// `CADENCE_CACHE__PERSIST_INTERVAL_SECS=10`.
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.cache.persistence == PersistencePolicy::Periodic
            && self.cache.persist_interval_secs == 0
        {
            return Err(crate::error::CadenceError::Config(
                "cache.persist_interval_secs must be > 0 for periodic persistence".to_string(),
            ));
        }
        if self.cache.stats_retention == 0 {
            return Err(crate::error::CadenceError::Config(
                "cache.stats_retention must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
