//! Durable queue of mutations that could not reach the network.
//!
//! Each wake replays every entry once, oldest first. Entries are independent:
//! a failing entry never stops the ones after it.
//!
//! | replay result             | entry            | counted as |
//! |---------------------------|------------------|------------|
//! | 2xx                       | removed          | synced     |
//! | 4xx                       | removed          | failed     |
//! | 5xx, other, no response   | `retries += 1`   | failed     |
//! | `retries >= max` already  | removed unsent   | failed     |

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use super::messages::ClientMessage;
use crate::http::{FetchError, FetchRequest, Fetcher};

pub const MAX_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A write waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    /// Exact request body bytes; base64 in the JSON form
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_body")]
    pub body: Option<Vec<u8>>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub retries: u32,
}

impl QueuedMutation {
    /// A mutation with an optional JSON body, sent as `application/json`.
    pub fn new(url: &str, method: &str, body: Option<Value>) -> Self {
        let mutation = Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            method: method.to_ascii_uppercase(),
            headers: BTreeMap::new(),
            body: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            retries: 0,
        };
        match body {
            Some(value) => mutation
                .with_header("content-type", "application/json")
                .with_body(value.to_string()),
            None => mutation,
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Captures a request that failed to reach the network, body untouched.
    pub fn from_request(request: &FetchRequest) -> Self {
        Self {
            headers: request.headers.clone(),
            body: request.body.clone(),
            ..Self::new(request.url.as_str(), &request.method, None)
        }
    }

    /// Rebuilds the original request.
    pub fn to_request(&self) -> Result<FetchRequest, FetchError> {
        let mut request = FetchRequest::new(&self.method, &self.url)?;
        request.headers = self.headers.clone();
        request.body = self.body.clone();
        Ok(request)
    }
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Result of one wake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub synced: usize,
    pub failed: usize,
    pub remaining: usize,
}

#[derive(sqlx::FromRow)]
struct MutationRow {
    id: String,
    url: String,
    method: String,
    headers: String,
    body: Option<Vec<u8>>,
    timestamp: i64,
    retries: i64,
}

impl MutationRow {
    fn into_mutation(self) -> Result<QueuedMutation, QueueError> {
        Ok(QueuedMutation {
            headers: serde_json::from_str(&self.headers)?,
            body: self.body,
            retries: u32::try_from(self.retries).unwrap_or(0),
            id: self.id,
            url: self.url,
            method: self.method,
            timestamp: self.timestamp,
        })
    }
}

pub struct MutationQueue {
    pool: SqlitePool,
    fetcher: Arc<dyn Fetcher>,
    max_retries: u32,
    clients: broadcast::Sender<ClientMessage>,
    // One wake at a time
    processing: Mutex<()>,
}

impl MutationQueue {
    pub(crate) fn new(
        pool: SqlitePool,
        fetcher: Arc<dyn Fetcher>,
        clients: broadcast::Sender<ClientMessage>,
    ) -> Self {
        Self {
            pool,
            fetcher,
            max_retries: MAX_RETRIES,
            clients,
            processing: Mutex::new(()),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Persists a mutation for later replay. Enqueuing an id twice keeps the
    /// first entry.
    pub async fn enqueue(&self, mutation: &QueuedMutation) -> Result<String, QueueError> {
        sqlx::query(
            r#"
            INSERT INTO mutation_queue (id, url, method, headers, body, timestamp, retries)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&mutation.id)
        .bind(&mutation.url)
        .bind(&mutation.method)
        .bind(serde_json::to_string(&mutation.headers)?)
        .bind(mutation.body.as_deref())
        .bind(mutation.timestamp)
        .bind(i64::from(mutation.retries))
        .execute(&self.pool)
        .await?;

        tracing::info!(id = %mutation.id, method = %mutation.method, url = %mutation.url, "mutation queued");
        Ok(mutation.id.clone())
    }

    /// Queued entries, oldest first.
    pub async fn list(&self) -> Result<Vec<QueuedMutation>, QueueError> {
        let rows: Vec<MutationRow> = sqlx::query_as(
            "SELECT id, url, method, headers, body, timestamp, retries FROM mutation_queue ORDER BY timestamp, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MutationRow::into_mutation).collect()
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueuedMutation>, QueueError> {
        let row: Option<MutationRow> = sqlx::query_as(
            "SELECT id, url, method, headers, body, timestamp, retries FROM mutation_queue WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(MutationRow::into_mutation).transpose()
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mutation_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn remove(&self, id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM mutation_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_retries(&self, id: &str) -> Result<(), QueueError> {
        sqlx::query("UPDATE mutation_queue SET retries = retries + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn notify(&self, message: ClientMessage) {
        // No connected clients is fine
        let _ = self.clients.send(message);
    }

    /// Replays every queued mutation once and reports the outcome.
    pub async fn process(&self) -> Result<SyncSummary, QueueError> {
        let _processing = self.processing.lock().await;

        let entries = self.list().await?;
        self.notify(ClientMessage::SyncStarted {
            pending: entries.len(),
        });

        let mut summary = SyncSummary::default();
        for entry in entries {
            if entry.retries >= self.max_retries {
                tracing::warn!(id = %entry.id, retries = entry.retries, "dropping mutation after max retries");
                self.remove(&entry.id).await?;
                summary.failed += 1;
                continue;
            }

            let request = match entry.to_request() {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(id = %entry.id, "dropping unreplayable mutation: {}", e);
                    self.remove(&entry.id).await?;
                    summary.failed += 1;
                    continue;
                }
            };

            match self.fetcher.fetch(&request).await {
                Ok(response) if response.is_success() => {
                    tracing::debug!(id = %entry.id, status = response.status, "mutation replayed");
                    self.remove(&entry.id).await?;
                    summary.synced += 1;
                }
                Ok(response) if (400..500).contains(&response.status) => {
                    tracing::warn!(id = %entry.id, status = response.status, "dropping rejected mutation");
                    self.remove(&entry.id).await?;
                    summary.failed += 1;
                }
                Ok(response) => {
                    tracing::warn!(id = %entry.id, status = response.status, "mutation replay failed, will retry");
                    self.bump_retries(&entry.id).await?;
                    summary.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(id = %entry.id, "mutation replay failed, will retry: {}", e);
                    self.bump_retries(&entry.id).await?;
                    summary.failed += 1;
                }
            }
        }

        summary.remaining = self.len().await?;
        tracing::info!(
            synced = summary.synced,
            failed = summary.failed,
            remaining = summary.remaining,
            "mutation queue processed"
        );
        self.notify(ClientMessage::SyncComplete(summary));
        Ok(summary)
    }
}
