use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use herdbook_core::worker::{default_fallback_routes, default_precache, FallbackRoute};

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

fn default_collections() -> Vec<String> {
    ["animals", "vaccines", "reproduction", "sales", "clients"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_active_interval() -> u64 {
    5
}

fn default_inactive_interval() -> u64 {
    30
}

fn default_initial_delay() -> u64 {
    1
}

fn default_batch_size() -> usize {
    herdbook_core::replication::DEFAULT_BATCH_SIZE
}

fn default_timeout() -> u64 {
    30
}

fn default_auto_sync() -> bool {
    true
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Backend URL (e.g., "http://localhost:8080" or "https://herd.example.com")
    pub server_url: Option<String>,
    /// API key for authentication
    pub api_key: Option<String>,
    /// Collections to replicate
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
    /// Polling period in seconds while watching in the foreground
    #[serde(default = "default_active_interval")]
    pub active_interval_secs: u64,
    /// Polling period in seconds while in the background
    #[serde(default = "default_inactive_interval")]
    pub inactive_interval_secs: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Sync before reading and after writing documents
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            collections: default_collections(),
            active_interval_secs: default_active_interval(),
            inactive_interval_secs: default_inactive_interval(),
            initial_delay_secs: default_initial_delay(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout(),
            auto_sync: default_auto_sync(),
        }
    }
}

impl SyncConfig {
    /// Returns true if sync is configured (has both server_url and api_key)
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.api_key.is_some()
    }

    pub fn scheduler(&self) -> herdbook_core::SchedulerConfig {
        herdbook_core::SchedulerConfig {
            active_interval: Duration::from_secs(self.active_interval_secs),
            inactive_interval: Duration::from_secs(self.inactive_interval_secs),
            initial_delay: Duration::from_secs(self.initial_delay_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_cache_version() -> String {
    "v1".to_string()
}

fn default_app_origin() -> String {
    "http://localhost:5173".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:4173".to_string()
}

/// Offline gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Version tag; bumping it invalidates every cached response
    #[serde(default = "default_cache_version")]
    pub version: String,
    /// Origin the gateway fronts
    #[serde(default = "default_app_origin")]
    pub app_origin: String,
    /// Address `herd serve` listens on
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_precache")]
    pub precache: Vec<String>,
    #[serde(default = "default_fallback_routes")]
    pub fallback_routes: Vec<FallbackRoute>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: default_cache_version(),
            app_origin: default_app_origin(),
            listen: default_listen(),
            precache: default_precache(),
            fallback_routes: default_fallback_routes(),
        }
    }
}

fn default_max_retries() -> u32 {
    herdbook_core::worker::MAX_RETRIES
}

fn default_periodic_interval() -> u64 {
    300
}

/// Mutation queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Periodic replay in seconds; 0 disables it
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            periodic_interval_secs: default_periodic_interval(),
        }
    }
}

impl QueueConfig {
    pub fn periodic_interval(&self) -> Option<Duration> {
        (self.periodic_interval_secs > 0).then(|| Duration::from_secs(self.periodic_interval_secs))
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Directory holding the store, worker database and auth cache
    pub data_dir: ConfigValue<PathBuf>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    sync: Option<SyncConfig>,
    cache: Option<CacheConfig>,
    queue: Option<QueueConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut data_dir = ConfigValue::new(Self::default_data_dir(), ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();
        let mut cache = CacheConfig::default();
        let mut queue = QueueConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(dir) = file_config.data_dir {
                // Resolve relative paths against config file's directory
                let resolved = if dir.is_relative() {
                    path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
                } else {
                    dir
                };
                data_dir = ConfigValue::new(resolved, ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
            if let Some(cache_config) = file_config.cache {
                cache = cache_config;
            }
            if let Some(queue_config) = file_config.queue {
                queue = queue_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(dir) = std::env::var("HERD_DATA_DIR") {
            data_dir = ConfigValue::new(PathBuf::from(dir), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("HERD_SYNC_URL") {
            sync.server_url = Some(url);
        }
        if let Ok(key) = std::env::var("HERD_SYNC_API_KEY") {
            sync.api_key = Some(key);
        }
        if let Ok(origin) = std::env::var("HERD_APP_ORIGIN") {
            cache.app_origin = origin;
        }

        Ok(Self {
            data_dir,
            config_file,
            sync,
            cache,
            queue,
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.value.join("store.db")
    }

    pub fn worker_path(&self) -> PathBuf {
        self.data_dir.value.join("worker.db")
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/herdbook/
    /// - macOS: ~/Library/Application Support/herdbook/
    /// - Windows: %APPDATA%/herdbook/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("herdbook")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/herdbook/
    /// - macOS: ~/Library/Application Support/herdbook/
    /// - Windows: %APPDATA%/herdbook/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("herdbook")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config.data_dir.value.to_string_lossy().contains("herdbook"));
        assert_eq!(config.data_dir.source, ConfigSource::Default);
        assert_eq!(config.sync.active_interval_secs, 5);
        assert_eq!(config.sync.inactive_interval_secs, 30);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.sync.collections.len(), 5);
        assert!(config.sync.auto_sync);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "data_dir: /srv/herdbook").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  server_url: http://herd.example.com").unwrap();
        writeln!(file, "  api_key: secret").unwrap();
        writeln!(file, "  collections: [animals, sales]").unwrap();
        writeln!(file, "  inactive_interval_secs: 60").unwrap();
        writeln!(file, "cache:").unwrap();
        writeln!(file, "  version: v7").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(config.data_dir.value, PathBuf::from("/srv/herdbook"));
        assert_eq!(config.data_dir.source, ConfigSource::File);
        assert!(config.sync.is_configured());
        assert_eq!(config.sync.collections, vec!["animals", "sales"]);
        assert_eq!(config.sync.inactive_interval_secs, 60);
        // unspecified fields keep their defaults
        assert_eq!(config.sync.active_interval_secs, 5);
        assert_eq!(config.cache.version, "v7");
        assert_eq!(config.cache.listen, "127.0.0.1:4173");
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_relative_data_dir_resolves_against_config_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "data_dir: data\n").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.data_dir.value, temp_dir.path().join("data"));
        assert_eq!(config.store_path(), temp_dir.path().join("data").join("store.db"));
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "data_dir: /from/file\n").unwrap();

        std::env::set_var("HERD_DATA_DIR", "/from/env");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.data_dir.value, PathBuf::from("/from/env"));
        assert_eq!(config.data_dir.source, ConfigSource::Environment);

        std::env::remove_var("HERD_DATA_DIR");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_periodic_interval_zero_disables() {
        let queue = QueueConfig {
            max_retries: 3,
            periodic_interval_secs: 0,
        };
        assert!(queue.periodic_interval().is_none());
        assert_eq!(
            QueueConfig::default().periodic_interval(),
            Some(Duration::from_secs(300))
        );
    }
}
