//! Cached authentication identity for offline use.
//!
//! The last identity confirmed by the backend is kept in a single JSON file
//! in the data directory. It is consulted only when the backend cannot be
//! asked, so the app stays usable offline instead of logging the user out.

use std::fs::{self, File};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::Identity;

const AUTH_CACHE_FILE: &str = "auth_session.json";

#[derive(Error, Debug)]
pub enum AuthCacheError {
    #[error("I/O error for {}: {1}", .0.display())]
    Io(PathBuf, #[source] io::Error),

    #[error("Failed to serialize session: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The cached record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub identity: Identity,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuthCache {
    path: PathBuf,
}

impl AuthCache {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(AUTH_CACHE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores `identity` as the last known session.
    pub fn cache(&self, identity: &Identity) -> Result<AuthSession, AuthCacheError> {
        let session = AuthSession {
            identity: identity.clone(),
            cached_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&session)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| AuthCacheError::Io(parent.to_path_buf(), e))?;
        }

        // Write atomically using temp file + rename
        let temp_path = self.path.with_extension("json.tmp");
        let mut file =
            File::create(&temp_path).map_err(|e| AuthCacheError::Io(temp_path.clone(), e))?;
        file.write_all(&bytes)
            .map_err(|e| AuthCacheError::Io(temp_path.clone(), e))?;
        file.sync_all()
            .map_err(|e| AuthCacheError::Io(temp_path.clone(), e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| AuthCacheError::Io(self.path.clone(), e))?;

        tracing::debug!(user_id = %identity.user_id, "auth session cached");
        Ok(session)
    }

    /// Returns the cached session. Missing or unreadable data yields `None`.
    pub fn get_cached(&self) -> Option<AuthSession> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read auth cache {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!("Ignoring corrupt auth cache {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Removes the cached session. Clearing an empty cache is not an error.
    pub fn clear(&self) -> Result<(), AuthCacheError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!("auth session cleared");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthCacheError::Io(self.path.clone(), e)),
        }
    }

    /// Resolves the current identity.
    ///
    /// - offline: the cached identity
    /// - online, backend confirms a session: cache it and return it
    /// - online, backend says there is no session: clear the cache
    /// - online, backend errors: fall back to the cached identity
    pub async fn resolve_identity<F, E>(&self, online: bool, fetch: F) -> Option<Identity>
    where
        F: Future<Output = Result<Option<Identity>, E>>,
        E: std::fmt::Display,
    {
        if !online {
            return self.get_cached().map(|s| s.identity);
        }

        match fetch.await {
            Ok(Some(identity)) => {
                if let Err(e) = self.cache(&identity) {
                    tracing::warn!("Failed to cache auth session: {}", e);
                }
                Some(identity)
            }
            Ok(None) => {
                if let Err(e) = self.clear() {
                    tracing::warn!("Failed to clear auth cache: {}", e);
                }
                None
            }
            Err(e) => {
                tracing::warn!("Auth check failed, using cached identity: {}", e);
                self.get_cached().map(|s| s.identity)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity() -> Identity {
        Identity {
            user_id: "rancher".into(),
            farm_id: "farm-1".into(),
        }
    }

    fn test_cache() -> (AuthCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        (AuthCache::new(temp_dir.path()), temp_dir)
    }

    #[test]
    fn test_missing_cache_returns_none() {
        let (cache, _temp) = test_cache();
        assert!(cache.get_cached().is_none());
    }

    #[test]
    fn test_cache_and_read_back() {
        let (cache, _temp) = test_cache();
        cache.cache(&identity()).unwrap();

        let session = cache.get_cached().unwrap();
        assert_eq!(session.identity, identity());
    }

    #[test]
    fn test_corrupt_cache_returns_none() {
        let (cache, _temp) = test_cache();
        fs::write(cache.path(), b"{ not json").unwrap();
        assert!(cache.get_cached().is_none());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (cache, _temp) = test_cache();
        cache.cache(&identity()).unwrap();
        cache.clear().unwrap();
        cache.clear().unwrap();
        assert!(cache.get_cached().is_none());
    }

    #[tokio::test]
    async fn test_resolve_offline_uses_cache_without_fetching() {
        let (cache, _temp) = test_cache();
        cache.cache(&identity()).unwrap();

        // A fetch reporting "no session" would clear the cache if it ran.
        let resolved = cache
            .resolve_identity(false, async { Ok::<_, String>(None) })
            .await;
        assert_eq!(resolved, Some(identity()));
        assert!(cache.get_cached().is_some());
    }

    #[tokio::test]
    async fn test_resolve_backend_error_falls_back_to_cache() {
        let (cache, _temp) = test_cache();
        cache.cache(&identity()).unwrap();

        let resolved = cache
            .resolve_identity(true, async { Err::<Option<Identity>, _>("connection refused") })
            .await;
        assert_eq!(resolved, Some(identity()));
    }

    #[tokio::test]
    async fn test_resolve_no_session_clears_cache() {
        let (cache, _temp) = test_cache();
        cache.cache(&identity()).unwrap();

        let resolved = cache
            .resolve_identity(true, async { Ok::<_, String>(None) })
            .await;
        assert!(resolved.is_none());
        assert!(cache.get_cached().is_none());
    }

    #[tokio::test]
    async fn test_resolve_success_refreshes_cache() {
        let (cache, _temp) = test_cache();

        let resolved = cache
            .resolve_identity(true, async { Ok::<_, String>(Some(identity())) })
            .await;
        assert_eq!(resolved, Some(identity()));
        assert_eq!(cache.get_cached().unwrap().identity, identity());
    }
}
