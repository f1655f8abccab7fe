//! Remote data source the replication handles pull from and push to.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::document::{
    Checkpoint, CountResponse, Identity, LocalDocument, PullBatch, PushRequest, PushResult,
};

/// Request timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),
}

impl RemoteError {
    /// True for failures that the next tick may not hit (transport errors
    /// and 5xx responses).
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Request(_) => true,
            RemoteError::Status { status, .. } => *status >= 500,
            RemoteError::UnknownCollection(_) => false,
        }
    }
}

/// A backend holding the authoritative copy of every collection.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Documents strictly after `since` in `(updated_at, id)` order, at most
    /// `limit` of them.
    async fn pull(
        &self,
        collection: &str,
        since: Option<&Checkpoint>,
        limit: usize,
    ) -> Result<PullBatch, RemoteError>;

    /// Sends local revisions. The backend applies last-write-wins.
    async fn push(
        &self,
        collection: &str,
        documents: Vec<LocalDocument>,
    ) -> Result<PushResult, RemoteError>;

    /// Number of non-deleted documents in the remote collection.
    async fn count(&self, collection: &str) -> Result<u64, RemoteError>;
}

/// [`RemoteSource`] over the backend's JSON API.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    server_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(server_url: String, api_key: String) -> Result<Self, RemoteError> {
        Self::with_timeout(server_url, api_key, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        server_url: String,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            server_url,
            api_key,
            client,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Fetches the identity behind the API key from `/me`.
    ///
    /// `Ok(None)` means the backend answered but has no session for the key.
    pub async fn fetch_identity(&self) -> Result<Option<Identity>, RemoteError> {
        let url = self.build_http_url("/me");
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(RemoteError::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }

    /// Checks `/health`. Any transport error or non-2xx counts as offline.
    pub async fn is_reachable(&self) -> bool {
        let url = self.build_http_url("/health");
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("health check failed: {}", e);
                false
            }
        }
    }

    /// Builds an HTTP URL for a given path.
    fn build_http_url(&self, path: &str) -> String {
        // Accept ws(s) URLs left over from older configs
        let base_url = if self.server_url.starts_with("ws://") {
            self.server_url.replacen("ws://", "http://", 1)
        } else if self.server_url.starts_with("wss://") {
            self.server_url.replacen("wss://", "https://", 1)
        } else if !self.server_url.starts_with("http://")
            && !self.server_url.starts_with("https://")
        {
            format!("http://{}", self.server_url)
        } else {
            self.server_url.clone()
        };

        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    fn check(&self, collection: &str, url: String, status: StatusCode) -> Result<(), RemoteError> {
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(RemoteError::UnknownCollection(collection.to_string()))
        } else {
            Err(RemoteError::Status {
                status: status.as_u16(),
                url,
            })
        }
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn pull(
        &self,
        collection: &str,
        since: Option<&Checkpoint>,
        limit: usize,
    ) -> Result<PullBatch, RemoteError> {
        let url = self.build_http_url(&format!("/api/collections/{}/pull", collection));

        let mut params = vec![("limit", limit.to_string())];
        if let Some(cp) = since {
            params.push(("since", cp.sequence.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&params)
            .send()
            .await?;
        self.check(collection, url, response.status())?;
        Ok(response.json().await?)
    }

    async fn push(
        &self,
        collection: &str,
        documents: Vec<LocalDocument>,
    ) -> Result<PushResult, RemoteError> {
        let url = self.build_http_url(&format!("/api/collections/{}/push", collection));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&PushRequest { documents })
            .send()
            .await?;
        self.check(collection, url, response.status())?;
        Ok(response.json().await?)
    }

    async fn count(&self, collection: &str) -> Result<u64, RemoteError> {
        let url = self.build_http_url(&format!("/api/collections/{}/count", collection));
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        self.check(collection, url, response.status())?;
        let body: CountResponse = response.json().await?;
        Ok(body.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote(url: &str) -> HttpRemote {
        HttpRemote::new(url.to_string(), "test-key".to_string()).unwrap()
    }

    #[test]
    fn test_build_http_url() {
        assert_eq!(
            remote("http://localhost:8080").build_http_url("/me"),
            "http://localhost:8080/me"
        );
        assert_eq!(
            remote("ws://localhost:8080/").build_http_url("/me"),
            "http://localhost:8080/me"
        );
        assert_eq!(
            remote("wss://sync.example.com").build_http_url("/me"),
            "https://sync.example.com/me"
        );
        assert_eq!(
            remote("sync.example.com").build_http_url("/health"),
            "http://sync.example.com/health"
        );
    }

    #[tokio::test]
    async fn test_pull_sends_cursor_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/collections/animals/pull"))
            .and(header("authorization", "Bearer test-key"))
            .and(query_param("since", "41"))
            .and(query_param("limit", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "documents": [{
                    "id": "a2",
                    "data": {"name": "Daisy"},
                    "updated_at": "2025-03-01T10:00:01.000000Z",
                    "_deleted": false
                }],
                "checkpoint": {"sequence": 42}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let batch = remote(&server.uri())
            .pull("animals", Some(&Checkpoint { sequence: 41 }), 50)
            .await
            .unwrap();
        assert_eq!(batch.documents.len(), 1);
        assert_eq!(batch.documents[0].id, "a2");
        assert_eq!(batch.checkpoint, Some(Checkpoint { sequence: 42 }));
    }

    #[tokio::test]
    async fn test_status_errors_classify_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/collections/animals/count"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/collections/ghosts/count"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let remote = remote(&server.uri());
        let err = remote.count("animals").await.unwrap_err();
        assert!(err.is_transient());

        let err = remote.count("ghosts").await.unwrap_err();
        assert!(matches!(err, RemoteError::UnknownCollection(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_fetch_identity_unauthorized_is_no_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(remote(&server.uri()).fetch_identity().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"user_id": "rancher", "farm_id": "farm-1"})),
            )
            .mount(&server)
            .await;

        let identity = remote(&server.uri()).fetch_identity().await.unwrap().unwrap();
        assert_eq!(identity.farm_id, "farm-1");
    }
}
