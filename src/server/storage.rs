//! Server-side document storage.
//!
//! One SQLite table holds every farm's collections. Writes follow the same
//! last-write-wins rule as the clients: a revision replaces the stored one
//! only if its timestamp is strictly newer. Every accepted write also takes
//! the next `seq`, and pulls page on `seq` rather than on the revision
//! timestamp, which is whatever the writing device's clock said.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use herdbook_core::document::{format_timestamp, next_revision, parse_timestamp};
use herdbook_core::{Checkpoint, LocalDocument, PullBatch, PushResult};

/// Upper bound on one pull page.
pub const MAX_PULL_LIMIT: usize = 1000;

/// Errors from the document store.
#[derive(Debug)]
pub enum StorageError {
    Database(sqlx::Error),
    Migration(sqlx::migrate::MigrateError),
    Serialization(serde_json::Error),
    /// A stored timestamp did not parse
    CorruptRow(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Database(e) => write!(f, "Database error: {}", e),
            StorageError::Migration(e) => write!(f, "Migration error: {}", e),
            StorageError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StorageError::CorruptRow(id) => write!(f, "Corrupt row for document '{}'", id),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Database(e) => Some(e),
            StorageError::Migration(e) => Some(e),
            StorageError::Serialization(e) => Some(e),
            StorageError::CorruptRow(_) => None,
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Database(e)
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StorageError::Migration(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e)
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    seq: i64,
    id: String,
    data: String,
    updated_at: String,
    deleted: bool,
}

impl DocumentRow {
    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            sequence: self.seq.max(0) as u64,
        }
    }

    fn into_document(self) -> Result<LocalDocument, StorageError> {
        let updated_at =
            parse_timestamp(&self.updated_at).ok_or_else(|| StorageError::CorruptRow(self.id.clone()))?;
        Ok(LocalDocument {
            data: serde_json::from_str(&self.data)?,
            id: self.id,
            updated_at,
            deleted: self.deleted,
        })
    }
}

/// Documents of every farm, keyed by `(farm_id, collection, id)`.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    pool: SqlitePool,
}

impl RemoteStore {
    /// Opens (creating if needed) the database at `path` and runs migrations.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Database(e.into()))?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn get(
        &self,
        farm_id: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<LocalDocument>, StorageError> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT seq, id, data, updated_at, deleted FROM documents WHERE farm_id = ? AND collection = ? AND id = ?",
        )
        .bind(farm_id)
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DocumentRow::into_document).transpose()
    }

    /// Documents written after `since`, in write order, tombstones included.
    pub async fn pull(
        &self,
        farm_id: &str,
        collection: &str,
        since: Option<&Checkpoint>,
        limit: usize,
    ) -> Result<PullBatch, StorageError> {
        let limit = limit.clamp(1, MAX_PULL_LIMIT) as i64;
        let after = since.map_or(0, |cp| cp.sequence.min(i64::MAX as u64) as i64);

        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT seq, id, data, updated_at, deleted FROM documents
            WHERE farm_id = ? AND collection = ? AND seq > ?
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(farm_id)
        .bind(collection)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let checkpoint = rows
            .last()
            .map(DocumentRow::checkpoint)
            .or_else(|| since.copied());
        let documents = rows
            .into_iter()
            .map(DocumentRow::into_document)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PullBatch {
            documents,
            checkpoint,
        })
    }

    /// Stores each revision that wins last-write-wins.
    pub async fn push(
        &self,
        farm_id: &str,
        collection: &str,
        documents: &[LocalDocument],
    ) -> Result<PushResult, StorageError> {
        let mut result = PushResult::default();

        // The write lock is held from the first insert until commit, so
        // sequences become visible in the order they were taken.
        let mut tx = self.pool.begin().await?;
        for doc in documents {
            let written = sqlx::query(
                r#"
                INSERT INTO documents (farm_id, collection, id, data, updated_at, deleted, seq)
                VALUES (?, ?, ?, ?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM documents))
                ON CONFLICT(farm_id, collection, id) DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at,
                    deleted = excluded.deleted,
                    seq = excluded.seq
                WHERE excluded.updated_at > documents.updated_at
                "#,
            )
            .bind(farm_id)
            .bind(collection)
            .bind(&doc.id)
            .bind(serde_json::to_string(&doc.data)?)
            .bind(format_timestamp(&doc.updated_at))
            .bind(doc.deleted)
            .execute(&mut *tx)
            .await?;

            if written.rows_affected() > 0 {
                result.accepted += 1;
            } else {
                result.rejected += 1;
            }
        }
        tx.commit().await?;

        Ok(result)
    }

    /// Number of non-deleted documents.
    pub async fn count(&self, farm_id: &str, collection: &str) -> Result<u64, StorageError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM documents WHERE farm_id = ? AND collection = ? AND deleted = 0",
        )
        .bind(farm_id)
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Writes `data` as a fresh server revision, reviving a tombstone.
    pub async fn upsert(
        &self,
        farm_id: &str,
        collection: &str,
        id: &str,
        data: serde_json::Value,
    ) -> Result<LocalDocument, StorageError> {
        let previous = self.get(farm_id, collection, id).await?;
        let doc = LocalDocument {
            id: id.to_string(),
            data,
            updated_at: next_revision(previous.map(|p| p.updated_at)),
            deleted: false,
        };
        self.push(farm_id, collection, std::slice::from_ref(&doc)).await?;
        Ok(doc)
    }

    /// Tombstones a document. `None` if it never existed; deleting a
    /// tombstone again leaves it as is.
    pub async fn soft_delete(
        &self,
        farm_id: &str,
        collection: &str,
        id: &str,
    ) -> Result<Option<LocalDocument>, StorageError> {
        let Some(existing) = self.get(farm_id, collection, id).await? else {
            return Ok(None);
        };
        if existing.deleted {
            return Ok(Some(existing));
        }

        let doc = LocalDocument {
            updated_at: next_revision(Some(existing.updated_at)),
            deleted: true,
            ..existing
        };
        self.push(farm_id, collection, std::slice::from_ref(&doc)).await?;
        Ok(Some(doc))
    }
}
