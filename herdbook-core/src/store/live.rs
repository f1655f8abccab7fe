//! Live queries: result sets that re-emit whenever a write touches them.

use std::collections::HashSet;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::{LocalStore, Query, StoreChange};
use crate::document::LocalDocument;

/// A subscription to a query's result set.
///
/// The first call to [`LiveQuery::next`] yields the result set as of
/// subscription time; later calls wait for a write touching the query.
/// Dropping or unsubscribing stops the background task and no further
/// results are delivered.
pub struct LiveQuery {
    collection: String,
    rx: watch::Receiver<Vec<LocalDocument>>,
    task: Option<JoinHandle<()>>,
    primed: bool,
}

impl LiveQuery {
    pub(super) fn spawn(
        store: LocalStore,
        collection: String,
        query: Query,
        initial: Vec<LocalDocument>,
        changes: broadcast::Receiver<StoreChange>,
    ) -> Self {
        let (tx, rx) = watch::channel(initial);
        let task = tokio::spawn(run(store, collection.clone(), query, tx, changes));

        Self {
            collection,
            rx,
            task: Some(task),
            primed: false,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The most recent result set, without waiting.
    pub fn current(&self) -> Vec<LocalDocument> {
        self.rx.borrow().clone()
    }

    /// Waits for the next result set. Returns `None` once unsubscribed.
    pub async fn next(&mut self) -> Option<Vec<LocalDocument>> {
        self.task.as_ref()?;

        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }

        self.rx.changed().await.ok()?;
        if self.task.is_none() {
            return None;
        }
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Cancels the subscription.
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(collection = %self.collection, "live query unsubscribed");
        }
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn run(
    store: LocalStore,
    collection: String,
    query: Query,
    tx: watch::Sender<Vec<LocalDocument>>,
    mut changes: broadcast::Receiver<StoreChange>,
) {
    loop {
        let refresh = match changes.recv().await {
            Ok(change) => {
                let ids: HashSet<String> = tx.borrow().iter().map(|d| d.id.clone()).collect();
                query.matches(&change.document) || ids.contains(&change.document.id)
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(%collection, skipped, "live query lagged, refreshing");
                true
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if !refresh {
            continue;
        }

        match store.find(&collection, &query).await {
            Ok(docs) => {
                if tx.send(docs).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(%collection, "live query refresh failed: {}", e);
            }
        }
    }
}
