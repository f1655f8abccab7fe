//! Server configuration.
//!
//! Environment variables:
//! - `HERDBOOK_PORT`: Port to listen on (default: 8080)
//! - `HERDBOOK_DATABASE_PATH`: SQLite database (default: ~/.local/share/herdbook-server/herdbook.db)
//! - `HERDBOOK_CONFIG`: Path to config file (default: ~/.config/herdbook-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "rancher1"
//!     farm_id: "farm1"
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub database_path: PathBuf,
    pub config_path: PathBuf,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let port = var("HERDBOOK_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let database_path = var("HERDBOOK_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("herdbook-server")
                    .join("herdbook.db")
            });

        let config_path = var("HERDBOOK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("herdbook-server")
                    .join("config.yaml")
            });

        Self {
            port,
            database_path,
            config_path,
        }
    }
}

/// API key entry in config
#[derive(Debug, Clone, Deserialize)]
struct ApiKeyEntry {
    key: String,
    user_id: String,
    farm_id: String,
}

/// Config file structure
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

/// Authenticated caller, added to request extensions after auth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
    pub farm_id: String,
}

/// API key store - maps key -> AuthUser
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    keys: HashMap<String, AuthUser>,
}

impl ApiKeyStore {
    /// Load API keys from config file. A missing or broken file yields an
    /// empty store.
    pub fn load(config_path: &Path) -> Self {
        let keys = match std::fs::read_to_string(config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(store) => {
                    tracing::info!("Loaded {} API key(s)", store.keys.len());
                    store.keys
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file: {}", e);
                    HashMap::new()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}",
                    config_path.display(),
                    e
                );
                tracing::warn!("No API keys loaded - all authenticated requests will fail");
                HashMap::new()
            }
        };

        Self { keys }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
        let config: ConfigFile = serde_yaml::from_str(contents)?;
        let keys = config
            .api_keys
            .into_iter()
            .map(|entry| {
                (
                    entry.key,
                    AuthUser {
                        user_id: entry.user_id,
                        farm_id: entry.farm_id,
                    },
                )
            })
            .collect();
        Ok(Self { keys })
    }

    pub fn with_key(mut self, key: &str, user_id: &str, farm_id: &str) -> Self {
        self.keys.insert(
            key.to_string(),
            AuthUser {
                user_id: user_id.to_string(),
                farm_id: farm_id.to_string(),
            },
        );
        self
    }

    /// Validate an API key and return the associated user
    pub fn validate(&self, key: &str) -> Option<AuthUser> {
        self.keys.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_env() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config.port, 8080);
        assert!(config.database_path.ends_with("herdbook-server/herdbook.db"));
        assert!(config.config_path.ends_with("herdbook-server/config.yaml"));
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::from_lookup(|name| match name {
            "HERDBOOK_PORT" => Some("9090".to_string()),
            "HERDBOOK_DATABASE_PATH" => Some("/srv/herd.db".to_string()),
            _ => None,
        });
        assert_eq!(config.port, 9090);
        assert_eq!(config.database_path, PathBuf::from("/srv/herd.db"));
    }

    #[test]
    fn test_invalid_port_falls_back_to_default() {
        let config = ServerConfig::from_lookup(|name| {
            (name == "HERDBOOK_PORT").then(|| "not-a-port".to_string())
        });
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_load_api_keys() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "api_keys:\n  - key: k1\n    user_id: rancher\n    farm_id: farm-1\n",
        )
        .unwrap();

        let store = ApiKeyStore::load(&path);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.validate("k1"),
            Some(AuthUser {
                user_id: "rancher".into(),
                farm_id: "farm-1".into(),
            })
        );
        assert!(store.validate("k2").is_none());
    }

    #[test]
    fn test_missing_config_file_yields_empty_store() {
        let temp_dir = tempdir().unwrap();
        let store = ApiKeyStore::load(&temp_dir.path().join("missing.yaml"));
        assert_eq!(store.len(), 0);
    }
}
