//! Local document store.
//!
//! An embedded SQLite database holding every replicated collection. Writes
//! broadcast a [`StoreChange`] on the collection's channel, which drives
//! [`LiveQuery`] subscriptions. Rows are never hard-deleted: `soft_delete`
//! leaves a tombstone so the deletion replicates.
//!
//! Collections must be registered before use. Any call against an
//! unregistered collection fails with [`StoreError::NotInitialized`] instead
//! of queuing, so callers have to wait for the store to be ready.

mod live;
mod query;

pub use live::LiveQuery;
pub use query::Query;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::db::{open_pool, STORE_MIGRATIONS};
use crate::document::{
    format_timestamp, is_valid_collection_name, next_revision, parse_timestamp, Checkpoint,
    LocalDocument,
};

/// Buffer of pending change notifications per collection.
const CHANGE_BUFFER: usize = 256;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Collection '{0}' is not initialized")]
    NotInitialized(String),

    #[error("Invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("Document '{id}' not found in '{collection}'")]
    NotFound { collection: String, id: String },

    #[error("Invalid timestamp stored for '{0}'")]
    InvalidTimestamp(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Replication,
}

/// Notification emitted after a document changed.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub collection: String,
    pub document: LocalDocument,
    pub origin: ChangeOrigin,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    data: String,
    updated_at: String,
    deleted: bool,
}

impl DocumentRow {
    fn into_document(self) -> Result<LocalDocument, StoreError> {
        let updated_at = parse_timestamp(&self.updated_at)
            .ok_or_else(|| StoreError::InvalidTimestamp(self.id.clone()))?;
        Ok(LocalDocument {
            data: serde_json::from_str(&self.data)?,
            id: self.id,
            updated_at,
            deleted: self.deleted,
        })
    }
}

struct StoreInner {
    pool: SqlitePool,
    channels: RwLock<HashMap<String, broadcast::Sender<StoreChange>>>,
}

/// Handle to the local store. Cheap to clone.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    /// Opens the store database at `path`, creating it if needed.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let pool = open_pool(path, &STORE_MIGRATIONS).await?;
        tracing::debug!("Local store opened at {}", path.display());
        Ok(Self {
            inner: Arc::new(StoreInner {
                pool,
                channels: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Makes a collection available. Registering twice is a no-op.
    pub fn register(&self, collection: &str) -> Result<(), StoreError> {
        if !is_valid_collection_name(collection) {
            return Err(StoreError::InvalidCollection(collection.to_string()));
        }
        let mut channels = self
            .inner
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels.entry(collection.to_string()).or_insert_with(|| {
            tracing::debug!(%collection, "collection registered");
            broadcast::channel(CHANGE_BUFFER).0
        });
        Ok(())
    }

    pub fn is_registered(&self, collection: &str) -> bool {
        self.inner
            .channels
            .read()
            .map(|channels| channels.contains_key(collection))
            .unwrap_or(false)
    }

    /// Registered collection names, sorted.
    pub fn collections(&self) -> Vec<String> {
        let channels = self
            .inner
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = channels.keys().cloned().collect();
        names.sort();
        names
    }

    fn channel(&self, collection: &str) -> Result<broadcast::Sender<StoreChange>, StoreError> {
        let channels = self
            .inner
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .get(collection)
            .cloned()
            .ok_or_else(|| StoreError::NotInitialized(collection.to_string()))
    }

    fn notify(&self, sender: &broadcast::Sender<StoreChange>, change: StoreChange) {
        // No receivers just means nobody is subscribed.
        let _ = sender.send(change);
    }

    /// Subscribes to the result set of `query`.
    pub async fn subscribe(&self, collection: &str, query: Query) -> Result<LiveQuery, StoreError> {
        let changes = self.channel(collection)?.subscribe();
        let initial = self.find(collection, &query).await?;
        Ok(LiveQuery::spawn(
            self.clone(),
            collection.to_string(),
            query,
            initial,
            changes,
        ))
    }

    /// Returns the current revision of a document, tombstones included.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<LocalDocument>, StoreError> {
        self.channel(collection)?;
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT id, data, updated_at, deleted FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.inner.pool)
        .await?;

        row.map(DocumentRow::into_document).transpose()
    }

    /// Returns the documents matching `query`, ordered by id.
    pub async fn find(&self, collection: &str, query: &Query) -> Result<Vec<LocalDocument>, StoreError> {
        self.channel(collection)?;
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT id, data, updated_at, deleted FROM documents
            WHERE collection = ? AND (deleted = 0 OR ?)
            ORDER BY id
            "#,
        )
        .bind(collection)
        .bind(query.includes_deleted())
        .fetch_all(&self.inner.pool)
        .await?;

        let docs = rows
            .into_iter()
            .map(DocumentRow::into_document)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(query.apply(docs))
    }

    /// Creates or replaces a document with a fresh revision.
    pub async fn write(
        &self,
        collection: &str,
        id: &str,
        data: serde_json::Value,
    ) -> Result<LocalDocument, StoreError> {
        let sender = self.channel(collection)?;
        let doc = loop {
            let previous = self.get(collection, id).await?.map(|p| p.updated_at);
            let doc = LocalDocument {
                id: id.to_string(),
                data: data.clone(),
                updated_at: next_revision(previous),
                deleted: false,
            };
            if self.put_local(collection, &doc, previous).await? {
                break doc;
            }
        };

        self.notify(
            &sender,
            StoreChange {
                collection: collection.to_string(),
                document: doc.clone(),
                origin: ChangeOrigin::Local,
            },
        );
        Ok(doc)
    }

    /// Marks a document as deleted. The row stays as a tombstone.
    pub async fn soft_delete(&self, collection: &str, id: &str) -> Result<LocalDocument, StoreError> {
        let sender = self.channel(collection)?;
        let doc = loop {
            let previous = self
                .get(collection, id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
            let expected = previous.updated_at;
            let doc = LocalDocument {
                updated_at: next_revision(Some(expected)),
                deleted: true,
                ..previous
            };
            if self.put_local(collection, &doc, Some(expected)).await? {
                break doc;
            }
        };

        self.notify(
            &sender,
            StoreChange {
                collection: collection.to_string(),
                document: doc.clone(),
                origin: ChangeOrigin::Local,
            },
        );
        Ok(doc)
    }

    /// Stores `doc` only if the row still holds the `previous` revision
    /// (absent when `None`). Returns false when another writer got in first;
    /// the caller re-reads and retries.
    async fn put_local(
        &self,
        collection: &str,
        doc: &LocalDocument,
        previous: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, updated_at, deleted, dirty)
            VALUES (?, ?, ?, ?, ?, 1)
            ON CONFLICT(collection, id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at,
                deleted = excluded.deleted,
                dirty = 1
            WHERE documents.updated_at = ?
            "#,
        )
        .bind(collection)
        .bind(&doc.id)
        .bind(serde_json::to_string(&doc.data)?)
        .bind(format_timestamp(&doc.updated_at))
        .bind(doc.deleted)
        .bind(previous.as_ref().map(format_timestamp))
        .execute(&self.inner.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(%collection, id = %doc.id, "concurrent write, retrying");
            return Ok(false);
        }
        Ok(true)
    }

    /// Number of live (non-deleted) documents.
    pub async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        self.channel(collection)?;
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM documents WHERE collection = ? AND deleted = 0",
        )
        .bind(collection)
        .fetch_one(&self.inner.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Local revisions not yet pushed to the remote.
    pub async fn dirty(&self, collection: &str) -> Result<Vec<LocalDocument>, StoreError> {
        self.channel(collection)?;
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT id, data, updated_at, deleted FROM documents
            WHERE collection = ? AND dirty = 1
            ORDER BY updated_at, id
            "#,
        )
        .bind(collection)
        .fetch_all(&self.inner.pool)
        .await?;

        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    /// Clears the dirty flag for pushed revisions. A row rewritten since the
    /// push carries a newer `updated_at` and stays dirty.
    pub async fn mark_clean(&self, collection: &str, docs: &[LocalDocument]) -> Result<(), StoreError> {
        self.channel(collection)?;
        let mut tx = self.inner.pool.begin().await?;
        for doc in docs {
            sqlx::query(
                "UPDATE documents SET dirty = 0 WHERE collection = ? AND id = ? AND updated_at = ?",
            )
            .bind(collection)
            .bind(&doc.id)
            .bind(format_timestamp(&doc.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Applies replicated revisions under last-write-wins.
    ///
    /// A revision is stored only if it is strictly newer than the local one,
    /// so replaying a batch is a no-op. Returns the number of documents that
    /// changed.
    pub async fn apply_remote(
        &self,
        collection: &str,
        docs: &[LocalDocument],
    ) -> Result<usize, StoreError> {
        let sender = self.channel(collection)?;
        let mut applied = Vec::new();

        let mut tx = self.inner.pool.begin().await?;
        for doc in docs {
            let result = sqlx::query(
                r#"
                INSERT INTO documents (collection, id, data, updated_at, deleted, dirty)
                VALUES (?, ?, ?, ?, ?, 0)
                ON CONFLICT(collection, id) DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at,
                    deleted = excluded.deleted,
                    dirty = 0
                WHERE excluded.updated_at > documents.updated_at
                "#,
            )
            .bind(collection)
            .bind(&doc.id)
            .bind(serde_json::to_string(&doc.data)?)
            .bind(format_timestamp(&doc.updated_at))
            .bind(doc.deleted)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                applied.push(doc.clone());
            }
        }
        tx.commit().await?;

        for doc in &applied {
            self.notify(
                &sender,
                StoreChange {
                    collection: collection.to_string(),
                    document: doc.clone(),
                    origin: ChangeOrigin::Replication,
                },
            );
        }
        Ok(applied.len())
    }

    /// Loads the replication checkpoint. A corrupt cursor is discarded, which
    /// makes the next pull start from the beginning.
    pub async fn checkpoint(&self, collection: &str) -> Result<Option<Checkpoint>, StoreError> {
        self.channel(collection)?;
        let row: Option<(String,)> =
            sqlx::query_as("SELECT cursor FROM checkpoints WHERE collection = ?")
                .bind(collection)
                .fetch_optional(&self.inner.pool)
                .await?;

        let Some((cursor,)) = row else {
            return Ok(None);
        };

        match serde_json::from_str::<Checkpoint>(&cursor) {
            Ok(cp) => Ok(Some(cp)),
            Err(e) => {
                tracing::warn!(%collection, "discarding corrupt checkpoint: {}", e);
                sqlx::query("DELETE FROM checkpoints WHERE collection = ?")
                    .bind(collection)
                    .execute(&self.inner.pool)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Persists a checkpoint. Older cursors are ignored; checkpoints only
    /// move forward.
    pub async fn save_checkpoint(&self, collection: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        if let Some(current) = self.checkpoint(collection).await? {
            if *checkpoint <= current {
                return Ok(());
            }
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (collection, cursor) VALUES (?, ?)
            ON CONFLICT(collection) DO UPDATE SET cursor = excluded.cursor
            "#,
        )
        .bind(collection)
        .bind(serde_json::to_string(checkpoint)?)
        .execute(&self.inner.pool)
        .await?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.inner.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.inner.pool)
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn corrupt_checkpoint(&self, collection: &str) {
        sqlx::query("INSERT OR REPLACE INTO checkpoints (collection, cursor) VALUES (?, 'not json')")
            .bind(collection)
            .execute(&self.inner.pool)
            .await
            .unwrap();
    }
}
