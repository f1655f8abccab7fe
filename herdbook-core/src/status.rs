//! "Initial sync complete" signal for the UI.
//!
//! The tracker samples local row counts on a fixed interval and the activity
//! of every replicator. Remote counts are fetched when tracking starts and
//! fetched again for a collection each time its replicator finishes another
//! run, so rows deleted remotely after the first fetch cannot keep the local
//! count short forever. They feed the percentage and, under
//! [`CompletionPolicy::RowCountAuthoritative`], decide completion. Once
//! complete the tracker stops polling and the result never flips back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::replication::{RemoteSource, ReplicationRegistry};
use crate::store::{LocalStore, StoreError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const COMPLETION_NOTICE_KEY: &str = "initial_sync_notice_shown";

/// How completion is decided when the two signals disagree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Complete as soon as either every replicator went idle after a run or
    /// every local count caught up with its remote count.
    Either,
    /// Row counts decide. Idle replicators only decide when remote counts
    /// could not be fetched.
    #[default]
    RowCountAuthoritative,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionProgress {
    pub collection: String,
    /// At least one non-empty pull batch arrived
    pub received_batch: bool,
    /// The replicator was seen idle after completing a run
    pub idle_seen: bool,
    pub local_count: u64,
    /// `None` while no remote count fetch has succeeded
    pub remote_count: Option<u64>,
}

impl CollectionProgress {
    fn caught_up(&self) -> Option<bool> {
        self.remote_count.map(|remote| self.local_count >= remote)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub collections: Vec<CollectionProgress>,
    pub complete: bool,
}

impl SyncProgress {
    /// Share of remote rows present locally, 0-100.
    pub fn percent(&self) -> u8 {
        if self.complete {
            return 100;
        }
        let (local, remote) = self
            .collections
            .iter()
            .filter_map(|c| c.remote_count.map(|r| (c.local_count.min(r), r)))
            .fold((0u64, 0u64), |(l, r), (cl, cr)| (l + cl, r + cr));
        if remote == 0 {
            return 0;
        }
        ((local * 100) / remote).min(100) as u8
    }

    fn all_idle(&self) -> bool {
        self.collections.iter().all(|c| c.idle_seen)
    }

    fn counts_caught_up(&self) -> Option<bool> {
        self.collections
            .iter()
            .map(CollectionProgress::caught_up)
            .collect::<Option<Vec<bool>>>()
            .map(|all| all.into_iter().all(|c| c))
    }

    /// Whether this snapshot counts as complete under `policy`.
    pub fn evaluate(&self, policy: CompletionPolicy) -> bool {
        if self.collections.is_empty() {
            return true;
        }
        match policy {
            CompletionPolicy::Either => {
                self.all_idle() || self.counts_caught_up() == Some(true)
            }
            CompletionPolicy::RowCountAuthoritative => match self.counts_caught_up() {
                Some(caught_up) => caught_up,
                None => self.all_idle(),
            },
        }
    }
}

struct TrackerInner {
    store: LocalStore,
    remote: Arc<dyn RemoteSource>,
    registry: ReplicationRegistry,
    policy: CompletionPolicy,
    poll_interval: Duration,
    progress: watch::Sender<SyncProgress>,
}

pub struct SyncStatusTracker {
    inner: Arc<TrackerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncStatusTracker {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteSource>,
        registry: ReplicationRegistry,
    ) -> Self {
        Self::with_options(
            store,
            remote,
            registry,
            CompletionPolicy::default(),
            DEFAULT_POLL_INTERVAL,
        )
    }

    pub fn with_options(
        store: LocalStore,
        remote: Arc<dyn RemoteSource>,
        registry: ReplicationRegistry,
        policy: CompletionPolicy,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                store,
                remote,
                registry,
                policy,
                poll_interval,
                progress: watch::channel(SyncProgress::default()).0,
            }),
            task: Mutex::new(None),
        }
    }

    /// Starts tracking from scratch. A running tracker is left alone.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.inner.progress.send_replace(SyncProgress::default());
        *task = Some(tokio::spawn(self.inner.clone().run()));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }

    pub fn progress(&self) -> SyncProgress {
        self.inner.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.inner.progress.subscribe()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.progress.borrow().complete
    }

    /// Waits until the initial sync is complete.
    pub async fn wait_complete(&self) -> SyncProgress {
        let mut rx = self.inner.progress.subscribe();
        let progress = match rx.wait_for(|p| p.complete).await {
            Ok(progress) => progress.clone(),
            // The sender lives in `inner`, which we hold.
            Err(_) => self.progress(),
        };
        progress
    }

    /// Returns true the first time it is called after completion, across
    /// sessions sharing the same store.
    pub async fn take_completion_notice(&self) -> Result<bool, StoreError> {
        if !self.is_complete() {
            return Ok(false);
        }
        let store = &self.inner.store;
        if store.get_meta(COMPLETION_NOTICE_KEY).await?.is_some() {
            return Ok(false);
        }
        store.set_meta(COMPLETION_NOTICE_KEY, "1").await?;
        Ok(true)
    }
}

impl Drop for SyncStatusTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TrackerInner {
    async fn run(self: Arc<Self>) {
        let mut progress = SyncProgress {
            collections: self
                .registry
                .names()
                .into_iter()
                .map(|name| CollectionProgress {
                    collection: name.to_string(),
                    ..Default::default()
                })
                .collect(),
            complete: false,
        };

        let activity: Vec<_> = self.registry.iter().map(|(_, r)| r.activity()).collect();
        // Completed runs as of each collection's last remote count fetch
        let mut counted_runs: Vec<u64> = activity.iter().map(|rx| rx.borrow().runs).collect();

        for entry in &mut progress.collections {
            self.refresh_remote_count(entry).await;
        }

        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            ticker.tick().await;

            for ((entry, rx), counted) in progress
                .collections
                .iter_mut()
                .zip(&activity)
                .zip(counted_runs.iter_mut())
            {
                let current = *rx.borrow();
                entry.received_batch |= current.batches > 0;
                entry.idle_seen |= current.runs > 0 && !current.active;

                if !current.active && current.runs > *counted {
                    *counted = current.runs;
                    self.refresh_remote_count(entry).await;
                }

                match self.store.count(&entry.collection).await {
                    Ok(count) => entry.local_count = count,
                    Err(e) => {
                        tracing::debug!(collection = %entry.collection, "local count failed: {}", e)
                    }
                }
            }

            progress.complete = progress.evaluate(self.policy);
            self.progress.send_replace(progress.clone());

            if progress.complete {
                tracing::info!(
                    collections = progress.collections.len(),
                    "initial sync complete"
                );
                break;
            }
        }
    }

    /// Keeps the previous count when the fetch fails.
    async fn refresh_remote_count(&self, entry: &mut CollectionProgress) {
        match self.remote.count(&entry.collection).await {
            Ok(count) => entry.remote_count = Some(count),
            Err(e) => {
                tracing::warn!(collection = %entry.collection, "remote count unavailable: {}", e)
            }
        }
    }
}
