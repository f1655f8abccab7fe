//! Minimal request/response model for the cache manager and the mutation
//! queue, plus the network [`Fetcher`] they go through.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    #[default]
    Cors,
    NoCors,
}

/// What the response will be used for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Document,
    Script,
    Style,
    Image,
    Font,
    #[default]
    Empty,
}

/// Where a response came from, in browser terms. Only `Basic` responses
/// (same origin as the app) are safe to cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Basic,
    Cors,
    Opaque,
    Synthetic,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Basic => "basic",
            ResponseKind::Cors => "cors",
            ResponseKind::Opaque => "opaque",
            ResponseKind::Synthetic => "synthetic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(ResponseKind::Basic),
            "cors" => Some(ResponseKind::Cors),
            "opaque" => Some(ResponseKind::Opaque),
            "synthetic" => Some(ResponseKind::Synthetic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: Url,
    pub method: String,
    /// Lower-cased header names
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub destination: Destination,
    pub mode: RequestMode,
}

impl FetchRequest {
    pub fn new(method: &str, url: &str) -> Result<Self, FetchError> {
        Ok(Self {
            url: Url::parse(url)?,
            method: method.to_ascii_uppercase(),
            headers: BTreeMap::new(),
            body: None,
            destination: Destination::default(),
            mode: RequestMode::default(),
        })
    }

    pub fn get(url: &str) -> Result<Self, FetchError> {
        Self::new("GET", url)
    }

    /// A top-level page load.
    pub fn navigate(url: &str) -> Result<Self, FetchError> {
        let mut request = Self::get(url)?;
        request.mode = RequestMode::Navigate;
        request.destination = Destination::Document;
        request
            .headers
            .insert("accept".into(), "text/html,application/xhtml+xml".into());
        Ok(request)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    /// Anything other than GET and HEAD.
    pub fn is_mutation(&self) -> bool {
        !matches!(self.method.as_str(), "GET" | "HEAD")
    }

    pub fn accepts_html(&self) -> bool {
        self.header("accept")
            .is_some_and(|accept| accept.contains("text/html"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub kind: ResponseKind,
}

impl FetchResponse {
    /// A response built locally rather than received.
    pub fn synthetic(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        Self {
            status,
            headers,
            body: body.into(),
            kind: ResponseKind::Synthetic,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Performs network requests.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// `Err` means the request never produced a response (offline, DNS,
    /// timeout). HTTP error statuses are `Ok`.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// [`Fetcher`] over reqwest. Responses from the app origin are `Basic`,
/// everything else `Cors`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    app_origin: url::Origin,
}

impl HttpFetcher {
    pub fn new(app_origin: &Url, timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            app_origin: app_origin.origin(),
        })
    }

    fn kind_for(&self, url: &Url) -> ResponseKind {
        if url.origin() == self.app_origin {
            ResponseKind::Basic
        } else {
            ResponseKind::Cors
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| FetchError::InvalidMethod(request.method.clone()))?;

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        // Redirects may land on another origin
        let kind = self.kind_for(response.url());
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(FetchResponse {
            status,
            headers,
            body,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_shape_helpers() {
        let nav = FetchRequest::navigate("http://localhost:5173/animals/42").unwrap();
        assert!(nav.accepts_html());
        assert!(!nav.is_mutation());
        assert_eq!(nav.path(), "/animals/42");

        let post = FetchRequest::new("post", "http://localhost:5173/api/animals").unwrap();
        assert!(post.is_mutation());
        assert_eq!(post.method, "POST");
    }

    #[tokio::test]
    async fn test_same_origin_is_basic() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/animals"))
            .and(body_string("{\"name\":\"Bessie\"}"))
            .respond_with(ResponseTemplate::new(201).insert_header("x-request-id", "abc"))
            .mount(&server)
            .await;

        let origin = Url::parse(&server.uri()).unwrap();
        let fetcher = HttpFetcher::new(&origin, Duration::from_secs(5)).unwrap();
        let request = FetchRequest::new("POST", &format!("{}/api/animals", server.uri()))
            .unwrap()
            .with_body("{\"name\":\"Bessie\"}");

        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.kind, ResponseKind::Basic);
        assert_eq!(response.header("X-Request-Id"), Some("abc"));
    }

    #[tokio::test]
    async fn test_other_origin_is_cors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x"))
            .mount(&server)
            .await;

        let origin = Url::parse("http://app.herdbook.test").unwrap();
        let fetcher = HttpFetcher::new(&origin, Duration::from_secs(5)).unwrap();
        let request = FetchRequest::get(&format!("{}/font.woff2", server.uri())).unwrap();

        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.kind, ResponseKind::Cors);
    }
}
