use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use super::{RemoteSource, ReplicationError, Replicator};
use crate::document::Checkpoint;
use crate::store::LocalStore;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Published by each handle; the status tracker derives "idle" from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationActivity {
    /// A run is in flight
    pub active: bool,
    /// Completed runs since the handle was created
    pub runs: u64,
    /// Non-empty pull batches received so far
    pub batches: u64,
}

/// What one `re_sync` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub pushed: usize,
    pub rejected: usize,
    pub pulled: usize,
    pub applied: usize,
}

/// Replication of a single collection.
pub struct ReplicationHandle {
    collection: String,
    store: LocalStore,
    remote: Arc<dyn RemoteSource>,
    batch_size: usize,
    // Serializes re_sync calls for this collection
    run_lock: Mutex<()>,
    activity: watch::Sender<ReplicationActivity>,
}

/// Clears the `active` flag however the run ends.
struct ActiveGuard<'a>(&'a watch::Sender<ReplicationActivity>);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|a| a.active = false);
    }
}

impl ReplicationHandle {
    /// Creates the handle and registers `collection` with the store.
    pub fn new(
        collection: impl Into<String>,
        store: LocalStore,
        remote: Arc<dyn RemoteSource>,
    ) -> Result<Self, ReplicationError> {
        let collection = collection.into();
        store.register(&collection)?;
        Ok(Self {
            collection,
            store,
            remote,
            batch_size: DEFAULT_BATCH_SIZE,
            run_lock: Mutex::new(()),
            activity: watch::channel(ReplicationActivity::default()).0,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn snapshot(&self) -> ReplicationActivity {
        *self.activity.borrow()
    }

    async fn push_dirty(&self, outcome: &mut SyncOutcome) -> Result<(), ReplicationError> {
        let dirty = self.store.dirty(&self.collection).await?;
        for chunk in dirty.chunks(self.batch_size) {
            let result = self.remote.push(&self.collection, chunk.to_vec()).await?;
            // Rejected revisions lost to a newer remote one, which the pull
            // below brings back.
            self.store.mark_clean(&self.collection, chunk).await?;
            outcome.pushed += result.accepted;
            outcome.rejected += result.rejected;
        }
        Ok(())
    }

    async fn pull_all(&self, outcome: &mut SyncOutcome) -> Result<(), ReplicationError> {
        let mut checkpoint: Option<Checkpoint> = self.store.checkpoint(&self.collection).await?;

        loop {
            let batch = self
                .remote
                .pull(&self.collection, checkpoint.as_ref(), self.batch_size)
                .await?;
            let received = batch.documents.len();
            if received == 0 {
                break;
            }

            outcome.pulled += received;
            outcome.applied += self
                .store
                .apply_remote(&self.collection, &batch.documents)
                .await?;
            self.activity.send_modify(|a| a.batches += 1);

            match batch.checkpoint {
                Some(next) if checkpoint.map_or(true, |cp| next > cp) => {
                    self.store.save_checkpoint(&self.collection, &next).await?;
                    checkpoint = Some(next);
                }
                _ => {
                    tracing::warn!(
                        collection = %self.collection,
                        "remote returned a batch without advancing the checkpoint"
                    );
                    break;
                }
            }

            if received < self.batch_size {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Replicator for ReplicationHandle {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn activity(&self) -> watch::Receiver<ReplicationActivity> {
        self.activity.subscribe()
    }

    /// Pushes dirty revisions, then pulls from the stored checkpoint until a
    /// short batch.
    async fn re_sync(&self) -> Result<SyncOutcome, ReplicationError> {
        let _running = self.run_lock.lock().await;
        self.activity.send_modify(|a| a.active = true);
        let _guard = ActiveGuard(&self.activity);

        let mut outcome = SyncOutcome::default();
        self.push_dirty(&mut outcome).await?;
        self.pull_all(&mut outcome).await?;

        self.activity.send_modify(|a| a.runs += 1);
        tracing::debug!(
            collection = %self.collection,
            pushed = outcome.pushed,
            pulled = outcome.pulled,
            applied = outcome.applied,
            "re-sync finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::LocalDocument;
    use crate::replication::testing::MemoryRemote;
    use crate::store::tests::test_store;
    use crate::store::Query;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn remote_doc(id: &str, offset_secs: i64) -> LocalDocument {
        let mut doc = LocalDocument::new(id, json!({"name": id}));
        doc.updated_at = doc.updated_at - Duration::hours(1) + Duration::seconds(offset_secs);
        doc
    }

    #[tokio::test]
    async fn test_pull_pages_until_short_batch() {
        let ctx = test_store(&[]).await;
        let remote = Arc::new(MemoryRemote::default());
        for i in 0..5 {
            remote.seed("animals", remote_doc(&format!("a{}", i), i));
        }

        let handle = ReplicationHandle::new("animals", ctx.store.clone(), remote.clone())
            .unwrap()
            .with_batch_size(2);
        let outcome = handle.re_sync().await.unwrap();

        assert_eq!(outcome.pulled, 5);
        assert_eq!(outcome.applied, 5);
        // 2 + 2 + 1
        assert_eq!(remote.pulls.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.store.count("animals").await.unwrap(), 5);

        let cp = ctx.store.checkpoint("animals").await.unwrap().unwrap();
        assert_eq!(cp.sequence, 5);
        assert_eq!(handle.snapshot().runs, 1);
        assert!(!handle.snapshot().active);
    }

    #[tokio::test]
    async fn test_second_re_sync_changes_nothing() {
        let ctx = test_store(&[]).await;
        let remote = Arc::new(MemoryRemote::default());
        remote.seed("animals", remote_doc("a1", 0));
        remote.seed("animals", remote_doc("a2", 1));

        let handle = ReplicationHandle::new("animals", ctx.store.clone(), remote.clone()).unwrap();
        ctx.store.write("animals", "local", json!({"name": "Bessie"})).await.unwrap();

        handle.re_sync().await.unwrap();
        let count = ctx.store.count("animals").await.unwrap();
        let checkpoint = ctx.store.checkpoint("animals").await.unwrap();

        let second = handle.re_sync().await.unwrap();
        assert_eq!(second, SyncOutcome::default());
        assert_eq!(ctx.store.count("animals").await.unwrap(), count);
        assert_eq!(ctx.store.checkpoint("animals").await.unwrap(), checkpoint);
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_push_marks_clean_and_reaches_remote() {
        let ctx = test_store(&[]).await;
        let remote = Arc::new(MemoryRemote::default());
        let handle = ReplicationHandle::new("animals", ctx.store.clone(), remote.clone()).unwrap();

        ctx.store.write("animals", "a1", json!({"name": "Bessie"})).await.unwrap();
        ctx.store.soft_delete("animals", "a1").await.unwrap();

        let outcome = handle.re_sync().await.unwrap();
        assert_eq!(outcome.pushed, 1);
        assert!(ctx.store.dirty("animals").await.unwrap().is_empty());
        assert!(remote.get("animals", "a1").unwrap().deleted);
    }

    #[tokio::test]
    async fn test_newer_remote_revision_wins() {
        let ctx = test_store(&[]).await;
        let remote = Arc::new(MemoryRemote::default());
        let handle = ReplicationHandle::new("animals", ctx.store.clone(), remote.clone()).unwrap();

        let local = ctx.store.write("animals", "a1", json!({"name": "local"})).await.unwrap();
        let mut newer = local.clone();
        newer.data = json!({"name": "other device"});
        newer.updated_at = local.updated_at + Duration::seconds(5);
        remote.seed("animals", newer);

        let outcome = handle.re_sync().await.unwrap();
        assert_eq!(outcome.rejected, 1);

        let docs = ctx.store.find("animals", &Query::all()).await.unwrap();
        assert_eq!(docs[0].data["name"], "other device");
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_triggers_full_pull() {
        let ctx = test_store(&[]).await;
        let remote = Arc::new(MemoryRemote::default());
        remote.seed("animals", remote_doc("a1", 0));
        let handle = ReplicationHandle::new("animals", ctx.store.clone(), remote.clone()).unwrap();
        handle.re_sync().await.unwrap();

        ctx.store.corrupt_checkpoint("animals").await;
        let outcome = handle.re_sync().await.unwrap();

        // Everything is pulled again, but nothing changes locally.
        assert_eq!(outcome.pulled, 1);
        assert_eq!(outcome.applied, 0);
        assert!(ctx.store.checkpoint("animals").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_late_offline_write_reaches_device_that_synced_ahead() {
        let remote = Arc::new(MemoryRemote::default());
        let ctx_a = test_store(&[]).await;
        let ctx_b = test_store(&[]).await;
        let device_a = ReplicationHandle::new("animals", ctx_a.store.clone(), remote.clone()).unwrap();
        let device_b = ReplicationHandle::new("animals", ctx_b.store.clone(), remote.clone()).unwrap();

        // B records a calf while offline; A writes later and syncs first.
        let calf = ctx_b.store.write("animals", "calf-b", json!({"dam": "cow-a"})).await.unwrap();
        let cow = ctx_a.store.write("animals", "cow-a", json!({"tag": "A1"})).await.unwrap();
        assert!(calf.updated_at < cow.updated_at);
        device_a.re_sync().await.unwrap();

        device_b.re_sync().await.unwrap();
        let outcome = device_a.re_sync().await.unwrap();

        assert_eq!(outcome.applied, 1);
        let pulled = ctx_a.store.get("animals", "calf-b").await.unwrap().unwrap();
        assert_eq!(pulled.data, json!({"dam": "cow-a"}));
        assert_eq!(ctx_a.store.count("animals").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_run_clears_active_flag() {
        let ctx = test_store(&[]).await;
        let remote = Arc::new(MemoryRemote::default());
        remote.offline.store(true, Ordering::SeqCst);
        let handle = ReplicationHandle::new("animals", ctx.store.clone(), remote).unwrap();

        let err = handle.re_sync().await.unwrap_err();
        assert!(err.is_transient());
        let activity = handle.snapshot();
        assert!(!activity.active);
        assert_eq!(activity.runs, 0);
    }
}
