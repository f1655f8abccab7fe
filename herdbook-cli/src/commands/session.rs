//! Store, backend client and replication handles opened together for one
//! command invocation.

use std::sync::Arc;

use herdbook_core::{
    AuthCache, HttpRemote, LocalStore, RemoteSource, ReplicationError, ReplicationHandle,
    ReplicationRegistry, SyncOutcome,
};

use super::CommandError;
use crate::config::Config;

pub struct Session {
    pub store: LocalStore,
    remote: Option<Arc<HttpRemote>>,
    registry: ReplicationRegistry,
    auth: AuthCache,
}

impl Session {
    /// Opens the local store and, when sync is configured, one replication
    /// handle per configured collection.
    pub async fn open(config: &Config) -> Result<Self, CommandError> {
        let store = LocalStore::open(&config.store_path()).await?;

        let remote = match (&config.sync.server_url, &config.sync.api_key) {
            (Some(url), Some(key)) => Some(Arc::new(HttpRemote::with_timeout(
                url.clone(),
                key.clone(),
                config.sync.timeout(),
            )?)),
            _ => None,
        };

        let mut registry = ReplicationRegistry::new();
        for collection in &config.sync.collections {
            match &remote {
                Some(remote) => {
                    let source: Arc<dyn RemoteSource> = remote.clone();
                    let handle = ReplicationHandle::new(collection.clone(), store.clone(), source)?
                        .with_batch_size(config.sync.batch_size);
                    registry.register(Arc::new(handle));
                }
                None => store.register(collection)?,
            }
        }

        Ok(Self {
            store,
            remote,
            registry,
            auth: AuthCache::new(&config.data_dir.value),
        })
    }

    pub fn remote(&self) -> Result<Arc<HttpRemote>, CommandError> {
        self.remote.clone().ok_or(CommandError::NotConfigured)
    }

    pub fn registry(&self) -> &ReplicationRegistry {
        &self.registry
    }

    pub fn auth(&self) -> &AuthCache {
        &self.auth
    }

    /// Runs every handle once, in registry order. Failures are per collection.
    pub async fn sync_all(&self) -> Vec<(String, Result<SyncOutcome, ReplicationError>)> {
        let mut results = Vec::with_capacity(self.registry.len());
        for (name, replicator) in self.registry.iter() {
            results.push((name.to_string(), replicator.re_sync().await));
        }
        results
    }
}

/// Best-effort sync around document commands. Never fails the command.
pub fn try_auto_sync(config: &Config) {
    if !config.sync.auto_sync || !config.sync.is_configured() {
        return;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(_) => return,
    };

    rt.block_on(async {
        let session = match Session::open(config).await {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("auto-sync skipped: {}", e);
                return;
            }
        };
        let Ok(remote) = session.remote() else {
            return;
        };

        // Fast fail before touching every collection
        if !remote.is_reachable().await {
            eprintln!("Auto-sync: server unreachable, skipping");
            return;
        }

        for (collection, result) in session.sync_all().await {
            if let Err(e) = result {
                eprintln!("Auto-sync: {} failed: {}", collection, e);
            }
        }
    });
}
