//! Per-request caching strategies and the offline navigation fallback.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use url::Url;

use super::cache::{bucket_name, CacheError, CacheStorage};
use crate::http::{Destination, FetchError, FetchRequest, FetchResponse, Fetcher, RequestMode, ResponseKind};

pub const CACHE_PREFIX: &str = "herdbook";
pub const ROOT_SHELL: &str = "/";
pub const OFFLINE_PAGE: &str = "/offline.html";

/// Last-resort page when nothing usable is cached.
pub const OFFLINE_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Herdbook - offline</title>
<style>body{font-family:system-ui,sans-serif;margin:3rem auto;max-width:32rem;padding:0 1rem;color:#333}</style>
</head>
<body>
<h1>You are offline</h1>
<p>This page has not been saved on this device yet. Records you already opened are still available, and changes you make are kept until the connection returns.</p>
<p><a href="/">Back to the herd</a></p>
</body>
</html>
"#;

/// Detail pages under `prefix` fall back to the cached `list_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRoute {
    pub prefix: String,
    pub list_path: String,
}

impl FallbackRoute {
    pub fn new(prefix: &str, list_path: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            list_path: list_path.to_string(),
        }
    }

    /// A detail route is strictly longer than the prefix.
    fn matches(&self, path: &str) -> bool {
        path.len() > self.prefix.len() && path.starts_with(&self.prefix)
    }
}

pub fn default_fallback_routes() -> Vec<FallbackRoute> {
    ["animals", "vaccines", "reproduction", "sales", "clients"]
        .iter()
        .map(|name| FallbackRoute::new(&format!("/{}/", name), &format!("/{}", name)))
        .collect()
}

pub fn default_precache() -> Vec<String> {
    vec![
        ROOT_SHELL.to_string(),
        OFFLINE_PAGE.to_string(),
        "/manifest.webmanifest".to_string(),
    ]
}

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Page loads: network first, then the fallback chain
    Navigation,
    /// Application code: network first, cache only as fallback
    Framework,
    /// Other GETs: cache first
    Static,
    /// Not cacheable (mutations, HEAD)
    Passthrough,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub version: String,
    pub app_origin: Url,
    pub precache: Vec<String>,
    pub fallback_routes: Vec<FallbackRoute>,
    pub framework_prefixes: Vec<String>,
}

impl ManagerConfig {
    pub fn new(version: &str, app_origin: Url) -> Self {
        Self {
            version: version.to_string(),
            app_origin,
            precache: default_precache(),
            fallback_routes: default_fallback_routes(),
            framework_prefixes: vec!["/_app/".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub cached: usize,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct CacheManager {
    cache: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    config: ManagerConfig,
    bucket: String,
}

impl CacheManager {
    pub fn new(cache: CacheStorage, fetcher: Arc<dyn Fetcher>, config: ManagerConfig) -> Self {
        let bucket = bucket_name(CACHE_PREFIX, &config.version);
        Self {
            cache,
            fetcher,
            config,
            bucket,
        }
    }

    /// The bucket of the current version.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.cache
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    pub fn app_origin(&self) -> &Url {
        &self.config.app_origin
    }

    pub fn classify(&self, request: &FetchRequest) -> RequestClass {
        if !request.is_get() {
            return RequestClass::Passthrough;
        }
        if request.mode == RequestMode::Navigate || request.accepts_html() {
            return RequestClass::Navigation;
        }

        let path = request.path();
        let is_script = request.destination == Destination::Script
            || [".js", ".mjs", ".wasm"].iter().any(|ext| path.ends_with(ext))
            || self
                .config
                .framework_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()));
        if is_script {
            RequestClass::Framework
        } else {
            RequestClass::Static
        }
    }

    /// Serves a GET. `Err` only when the network failed and no cached copy
    /// could stand in; navigations always resolve.
    pub async fn handle(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        match self.classify(request) {
            RequestClass::Navigation => Ok(self.network_first_navigation(request).await),
            RequestClass::Framework => self.network_first(request).await,
            RequestClass::Static => self.cache_first(request).await,
            RequestClass::Passthrough => self.fetcher.fetch(request).await,
        }
    }

    async fn network_first_navigation(&self, request: &FetchRequest) -> FetchResponse {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store_if_cacheable(&request.url, &response).await;
                response
            }
            Err(e) => {
                tracing::debug!(url = %request.url, "navigation offline: {}", e);
                self.navigation_fallback(&request.url).await
            }
        }
    }

    /// Fallback order: exact entry, parent list page, root shell, offline
    /// page, then a generated offline response.
    pub async fn navigation_fallback(&self, url: &Url) -> FetchResponse {
        if let Some(hit) = self.lookup(&cache_key(url)).await {
            return hit;
        }

        if let Some(route) = self.parent_route(url.path()) {
            if let Some(hit) = self.lookup_path(&route.list_path).await {
                tracing::debug!(path = url.path(), list = %route.list_path, "serving parent list page");
                return hit;
            }
        }

        for path in [ROOT_SHELL, OFFLINE_PAGE] {
            if let Some(hit) = self.lookup_path(path).await {
                return hit;
            }
        }

        FetchResponse::synthetic(503, "text/html; charset=utf-8", OFFLINE_HTML)
    }

    fn parent_route(&self, path: &str) -> Option<&FallbackRoute> {
        self.config
            .fallback_routes
            .iter()
            .filter(|route| route.matches(path))
            .max_by_key(|route| route.prefix.len())
    }

    async fn network_first(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store_if_cacheable(&request.url, &response).await;
                Ok(response)
            }
            Err(e) => match self.lookup(&cache_key(&request.url)).await {
                Some(hit) => Ok(hit),
                None => Err(e),
            },
        }
    }

    async fn cache_first(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if let Some(hit) = self.lookup(&cache_key(&request.url)).await {
            return Ok(hit);
        }
        let response = self.fetcher.fetch(request).await?;
        self.store_if_cacheable(&request.url, &response).await;
        Ok(response)
    }

    /// Only complete same-origin responses are stored.
    async fn store_if_cacheable(&self, url: &Url, response: &FetchResponse) {
        if response.status != 200 || response.kind != ResponseKind::Basic {
            return;
        }
        if let Err(e) = self.cache.put(&self.bucket, &cache_key(url), response).await {
            tracing::warn!(%url, "failed to cache response: {}", e);
        }
    }

    async fn lookup(&self, key: &str) -> Option<FetchResponse> {
        match self.cache.lookup(&self.bucket, key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key, "cache lookup failed: {}", e);
                None
            }
        }
    }

    async fn lookup_path(&self, path: &str) -> Option<FetchResponse> {
        let url = self.config.app_origin.join(path).ok()?;
        self.lookup(&cache_key(&url)).await
    }

    /// Precaches the manifest. Each asset is fetched independently.
    pub async fn install(&self) -> InstallReport {
        let paths = self.config.precache.clone();
        self.cache_urls(&paths).await
    }

    /// Fetches and stores each URL (absolute, or a path on the app origin).
    pub async fn cache_urls(&self, urls: &[String]) -> InstallReport {
        let results = join_all(urls.iter().map(|u| self.cache_one(u))).await;

        let mut report = InstallReport::default();
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(()) => report.cached += 1,
                Err(reason) => {
                    tracing::warn!(%url, "failed to cache: {}", reason);
                    report.failed.push(url.clone());
                }
            }
        }
        report
    }

    async fn cache_one(&self, url: &str) -> Result<(), String> {
        let url = self
            .config
            .app_origin
            .join(url)
            .map_err(|e| e.to_string())?;
        let request = FetchRequest::get(url.as_str()).map_err(|e| e.to_string())?;
        let response = self.fetcher.fetch(&request).await.map_err(|e| e.to_string())?;
        if response.status != 200 {
            return Err(format!("status {}", response.status));
        }
        if response.kind != ResponseKind::Basic {
            return Err(format!("{} response is not cacheable", response.kind.as_str()));
        }
        self.cache
            .put(&self.bucket, &cache_key(&url), &response)
            .await
            .map_err(|e| e.to_string())
    }

    /// Deletes every bucket other than the current one. Returns the names
    /// removed.
    pub async fn activate(&self) -> Result<Vec<String>, CacheError> {
        let mut removed = Vec::new();
        for name in self.cache.bucket_names().await? {
            if name != self.bucket {
                let entries = self.cache.delete_bucket(&name).await?;
                tracing::info!(bucket = %name, entries, "deleted stale cache bucket");
                removed.push(name);
            }
        }
        Ok(removed)
    }
}

/// Cache key for a URL: the URL without its fragment.
pub fn cache_key(url: &Url) -> String {
    let mut key = url.clone();
    key.set_fragment(None);
    key.to_string()
}
