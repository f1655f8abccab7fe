//! Per-collection replication between the local store and the backend.
//!
//! A [`ReplicationHandle`] pushes dirty local revisions and pulls remote ones
//! for one collection. Handles are kept in a [`ReplicationRegistry`] and
//! driven by the [`ReplicationScheduler`], which polls adaptively and reacts
//! to platform signals.

mod handle;
mod registry;
mod remote;
mod scheduler;

pub use handle::{ReplicationActivity, ReplicationHandle, SyncOutcome, DEFAULT_BATCH_SIZE};
pub use registry::ReplicationRegistry;
pub use remote::{HttpRemote, RemoteError, RemoteSource, DEFAULT_TIMEOUT};
pub use scheduler::{ReplicationScheduler, SchedulerConfig, SyncDispatch, SyncTrigger};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl ReplicationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplicationError::Remote(e) if e.is_transient())
    }
}

/// Something the scheduler can ask to synchronize one collection.
#[async_trait]
pub trait Replicator: Send + Sync {
    fn collection(&self) -> &str;

    /// Activity signal: whether a run is in flight and how many completed.
    fn activity(&self) -> watch::Receiver<ReplicationActivity>;

    async fn re_sync(&self) -> Result<SyncOutcome, ReplicationError>;
}
