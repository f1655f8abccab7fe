//! Herdbook Core Library
//!
//! Offline-first sync layer shared by the Herdbook CLI and backend: the local
//! document store, replication against the backend, the sync status signal,
//! the offline cache manager and the background mutation queue.

pub mod auth_cache;
mod db;
pub mod document;
pub mod http;
pub mod platform;
pub mod replication;
pub mod status;
pub mod store;
pub mod worker;

pub use auth_cache::{AuthCache, AuthCacheError, AuthSession};
pub use document::{
    Checkpoint, CountResponse, Identity, LocalDocument, PullBatch, PushRequest, PushResult,
};
pub use http::{FetchError, FetchRequest, FetchResponse, Fetcher, HttpFetcher, ResponseKind};
pub use platform::{NetworkStatus, Platform, PlatformEvent, SignalKind, Subscription, Subscriptions, Visibility};
pub use replication::{
    HttpRemote, RemoteError, RemoteSource, ReplicationActivity, ReplicationError,
    ReplicationHandle, ReplicationRegistry, ReplicationScheduler, Replicator, SchedulerConfig,
    SyncOutcome, SyncTrigger,
};
pub use status::{CompletionPolicy, SyncProgress, SyncStatusTracker};
pub use store::{ChangeOrigin, LiveQuery, LocalStore, Query, StoreChange, StoreError};
pub use worker::{
    ClientMessage, MutationQueue, QueuedMutation, ServiceWorker, SyncSummary, WorkerCommand,
    WorkerConfig, WorkerError, WorkerEvent, WorkerState,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
