//! Versioned cache buckets in the worker database.

use std::collections::BTreeMap;

use sqlx::SqlitePool;
use thiserror::Error;

use crate::document::{format_timestamp, now};
use crate::http::{FetchResponse, ResponseKind};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt cache entry for {0}")]
    CorruptEntry(String),
}

/// Name of the bucket for a version tag.
pub fn bucket_name(prefix: &str, version: &str) -> String {
    format!("{}-{}", prefix, version)
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    url: String,
    status: i64,
    headers: String,
    body: Vec<u8>,
    kind: String,
}

/// Request URL to response, grouped in named buckets.
#[derive(Clone)]
pub struct CacheStorage {
    pool: SqlitePool,
}

impl CacheStorage {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Looks up `url` in `bucket`.
    pub async fn lookup(&self, bucket: &str, url: &str) -> Result<Option<FetchResponse>, CacheError> {
        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT url, status, headers, body, kind FROM cache_entries WHERE bucket = ? AND url = ?",
        )
        .bind(bucket)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let headers: BTreeMap<String, String> = serde_json::from_str(&row.headers)?;
        let kind = ResponseKind::parse(&row.kind).ok_or_else(|| CacheError::CorruptEntry(row.url.clone()))?;
        let status = u16::try_from(row.status).map_err(|_| CacheError::CorruptEntry(row.url.clone()))?;

        Ok(Some(FetchResponse {
            status,
            headers,
            body: row.body,
            kind,
        }))
    }

    /// Stores a copy of `response`, replacing any previous entry.
    pub async fn put(&self, bucket: &str, url: &str, response: &FetchResponse) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (bucket, url, status, headers, body, kind, stored_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, url) DO UPDATE SET
                status = excluded.status,
                headers = excluded.headers,
                body = excluded.body,
                kind = excluded.kind,
                stored_at = excluded.stored_at
            "#,
        )
        .bind(bucket)
        .bind(url)
        .bind(i64::from(response.status))
        .bind(serde_json::to_string(&response.headers)?)
        .bind(&response.body)
        .bind(response.kind.as_str())
        .bind(format_timestamp(&now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, bucket: &str, url: &str) -> Result<bool, CacheError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE bucket = ? AND url = ?")
            .bind(bucket)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// URLs stored in `bucket`, sorted.
    pub async fn keys(&self, bucket: &str) -> Result<Vec<String>, CacheError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT url FROM cache_entries WHERE bucket = ? ORDER BY url")
                .bind(bucket)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(url,)| url).collect())
    }

    pub async fn bucket_names(&self) -> Result<Vec<String>, CacheError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT bucket FROM cache_entries ORDER BY bucket")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// Removes a whole bucket. Returns the number of entries dropped.
    pub async fn delete_bucket(&self, bucket: &str) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE bucket = ?")
            .bind(bucket)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
