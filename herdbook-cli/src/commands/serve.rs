//! Local offline gateway.
//!
//! `herd serve` puts the worker in front of the app origin: page loads and
//! assets go through the cache strategies and writes are queued while the
//! origin is unreachable. Control endpoints live under `/__herdbook/`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Args;
use serde::Serialize;
use tokio::sync::mpsc;
use url::Url;

use herdbook_core::http::{Destination, RequestMode};
use herdbook_core::worker::ManagerConfig;
use herdbook_core::{
    ClientMessage, FetchRequest, FetchResponse, Fetcher, HttpFetcher, NetworkStatus, Platform,
    PlatformEvent, ServiceWorker, SignalKind, Subscription, Subscriptions, Visibility,
    WorkerCommand, WorkerConfig, WorkerError, WorkerEvent,
};

use super::{runtime, CommandError};
use crate::config::Config;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const EVENT_BUFFER: usize = 32;

/// Request headers that describe the hop to the gateway, not the request.
const HOP_HEADERS: [&str; 5] = ["host", "connection", "content-length", "transfer-encoding", "keep-alive"];

/// Run the offline gateway
#[derive(Args)]
pub struct ServeCommand {
    /// Address to listen on (overrides cache.listen)
    #[arg(long)]
    listen: Option<String>,

    /// Seconds between connectivity checks of the app origin
    #[arg(long, default_value_t = 10)]
    ping_secs: u64,
}

impl ServeCommand {
    pub fn run(&self, config: &Config) -> Result<(), CommandError> {
        runtime()?.block_on(self.serve(config))
    }

    async fn serve(&self, config: &Config) -> Result<(), CommandError> {
        let listen = self.listen.clone().unwrap_or_else(|| config.cache.listen.clone());
        let addr: SocketAddr = listen
            .parse()
            .map_err(|e| CommandError::InvalidInput(format!("Invalid listen address '{}': {}", listen, e)))?;

        let worker = Arc::new(open_worker(config).await?);
        let report = worker.install().await?;
        println!(
            "Installed cache {} ({} cached, {} failed)",
            worker.manager().bucket(),
            report.cached,
            report.failed.len()
        );
        // The gateway is the only client, so there is nothing to wait for.
        worker.skip_waiting().await?;

        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let event_loop = worker.clone().spawn(rx);

        let platform = Platform::new(Visibility::Visible, NetworkStatus::Online);
        let mut subscriptions = Subscriptions::new();
        subscriptions.push(online_wake(&platform, events.clone()));
        subscriptions.push(report_client_messages(&worker));
        subscriptions.push(ping_origin(
            &worker,
            platform.clone(),
            Duration::from_secs(self.ping_secs.max(1)),
        ));

        let state = GatewayState {
            worker: worker.clone(),
            events: events.clone(),
            origin: worker.manager().app_origin().clone(),
        };
        let app = router(state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        println!("Serving {} on http://{}", config.cache.app_origin, addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

        subscriptions.cancel_all();
        drop(events);
        let _ = event_loop.await;
        println!("Gateway stopped.");
        Ok(())
    }
}

/// Opens the worker database with the configured cache and queue settings.
pub(super) async fn open_worker(config: &Config) -> Result<ServiceWorker, CommandError> {
    let origin = Url::parse(&config.cache.app_origin).map_err(|e| {
        CommandError::InvalidInput(format!("Invalid app origin '{}': {}", config.cache.app_origin, e))
    })?;

    let mut manager = ManagerConfig::new(&config.cache.version, origin.clone());
    manager.precache = config.cache.precache.clone();
    manager.fallback_routes = config.cache.fallback_routes.clone();

    let worker_config = WorkerConfig {
        manager,
        max_retries: config.queue.max_retries,
        periodic_interval: config.queue.periodic_interval(),
    };

    let fetcher = HttpFetcher::new(&origin, config.sync.timeout()).map_err(WorkerError::from)?;
    Ok(ServiceWorker::open(&config.worker_path(), worker_config, Arc::new(fetcher)).await?)
}

/// Wakes the queue whenever connectivity comes back.
fn online_wake(platform: &Platform, events: mpsc::Sender<WorkerEvent>) -> Subscription {
    let mut network = platform.watch(SignalKind::Network);
    Subscription::spawn("online-wake", async move {
        while let Some(event) = network.recv().await {
            if event == PlatformEvent::Network(NetworkStatus::Online)
                && events.send(WorkerEvent::Online).await.is_err()
            {
                break;
            }
        }
    })
}

fn report_client_messages(worker: &ServiceWorker) -> Subscription {
    let mut messages = worker.subscribe();
    Subscription::spawn("client-messages", async move {
        while let Ok(message) = messages.recv().await {
            match message {
                ClientMessage::SyncStarted { pending } => {
                    println!("Replaying {} queued mutation(s)...", pending);
                }
                ClientMessage::SyncComplete(summary) => {
                    println!(
                        "Replay done: {} synced, {} failed, {} remaining",
                        summary.synced, summary.failed, summary.remaining
                    );
                }
            }
        }
    })
}

/// Any response from the origin, whatever its status, counts as online.
fn ping_origin(worker: &ServiceWorker, platform: Platform, every: Duration) -> Subscription {
    let fetcher = worker.manager().fetcher().clone();
    let origin = worker.manager().app_origin().clone();
    Subscription::spawn("origin-ping", async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let status = match FetchRequest::new("HEAD", origin.as_str()) {
                Ok(request) => match fetcher.fetch(&request).await {
                    Ok(_) => NetworkStatus::Online,
                    Err(_) => NetworkStatus::Offline,
                },
                Err(_) => return,
            };
            platform.set_network(status);
        }
    })
}

#[derive(Clone)]
struct GatewayState {
    worker: Arc<ServiceWorker>,
    events: mpsc::Sender<WorkerEvent>,
    origin: Url,
}

fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/__herdbook/status", get(status))
        .route("/__herdbook/message", post(message))
        .route("/__herdbook/sync", post(sync))
        .fallback(proxy)
        .with_state(state)
}

#[derive(Serialize)]
struct StatusResponse {
    state: String,
    bucket: String,
    queued: usize,
}

async fn status(State(state): State<GatewayState>) -> Response {
    match state.worker.queue().len().await {
        Ok(queued) => Json(StatusResponse {
            state: format!("{:?}", state.worker.state()),
            bucket: state.worker.manager().bucket().to_string(),
            queued,
        })
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn message(State(state): State<GatewayState>, Json(command): Json<WorkerCommand>) -> StatusCode {
    deliver(&state, WorkerEvent::Message(command)).await
}

async fn sync(State(state): State<GatewayState>) -> StatusCode {
    deliver(&state, WorkerEvent::Sync).await
}

async fn deliver(state: &GatewayState, event: WorkerEvent) -> StatusCode {
    match state.events.send(event).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn proxy(State(state): State<GatewayState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, &e.to_string()),
    };

    let fetch = match to_fetch_request(&state.origin, &parts.method, &parts.uri, &parts.headers, &body) {
        Ok(fetch) => fetch,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    match state.worker.handle_fetch(&fetch).await {
        Ok(response) => from_fetch_response(response),
        Err(e) => {
            tracing::debug!(url = %fetch.url, "gateway request failed: {}", e);
            error_response(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

fn to_fetch_request(
    origin: &Url,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<FetchRequest, CommandError> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = origin
        .join(path)
        .map_err(|e| CommandError::InvalidInput(format!("Invalid request path '{}': {}", path, e)))?;

    let mut request = FetchRequest::new(method.as_str(), url.as_str()).map_err(WorkerError::from)?;
    for (name, value) in headers {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    let mode = request.header("sec-fetch-mode").map(request_mode);
    if let Some(mode) = mode {
        request = request.with_mode(mode);
    }
    let dest = request.header("sec-fetch-dest").map(destination);
    if let Some(dest) = dest {
        request = request.with_destination(dest);
    }
    if !body.is_empty() {
        request = request.with_body(body.to_vec());
    }
    Ok(request)
}

fn request_mode(value: &str) -> RequestMode {
    match value {
        "navigate" => RequestMode::Navigate,
        "same-origin" => RequestMode::SameOrigin,
        "no-cors" => RequestMode::NoCors,
        _ => RequestMode::Cors,
    }
}

fn destination(value: &str) -> Destination {
    match value {
        "document" => Destination::Document,
        "script" => Destination::Script,
        "style" => Destination::Style,
        "image" => Destination::Image,
        "font" => Destination::Font,
        _ => Destination::Empty,
    }
}

fn from_fetch_response(response: FetchResponse) -> Response {
    let mut builder = Response::builder()
        .status(response.status)
        .header("x-herdbook-response", response.kind.as_str());
    for (name, value) in &response.headers {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    match builder.body(Body::from(response.body)) {
        Ok(response) => response,
        Err(e) => error_response(StatusCode::BAD_GATEWAY, &e.to_string()),
    }
}

#[derive(Serialize)]
struct GatewayError<'a> {
    error: &'a str,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(GatewayError { error: message })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herdbook_core::worker::{OFFLINE_HTML, QUEUED_HEADER};
    use herdbook_core::FetchError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// Serves `/` and `/offline.html` while online; fails everything offline.
    struct ToggleFetcher {
        offline: AtomicBool,
    }

    #[async_trait]
    impl Fetcher for ToggleFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(FetchError::Unreachable(request.url.to_string()));
            }
            let mut response = FetchResponse::synthetic(200, "text/html", format!("page {}", request.path()));
            response.kind = herdbook_core::ResponseKind::Basic;
            Ok(response)
        }
    }

    async fn gateway() -> (Router, Arc<ServiceWorker>, Arc<ToggleFetcher>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let origin = Url::parse("http://farm.local").unwrap();
        let mut manager = ManagerConfig::new("v1", origin.clone());
        manager.precache = vec!["/".to_string(), "/offline.html".to_string()];

        let mut config = WorkerConfig::new(manager);
        config.periodic_interval = None;
        let fetcher = Arc::new(ToggleFetcher {
            offline: AtomicBool::new(false),
        });
        let worker = Arc::new(
            ServiceWorker::open(&temp_dir.path().join("worker.db"), config, fetcher.clone())
                .await
                .unwrap(),
        );
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        let (events, _rx) = mpsc::channel(4);
        let state = GatewayState {
            worker: worker.clone(),
            events,
            origin,
        };
        (router(state), worker, fetcher, temp_dir)
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_to_fetch_request_maps_navigation_headers() {
        let origin = Url::parse("http://farm.local").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("host", "127.0.0.1:4173".parse().unwrap());
        headers.insert("sec-fetch-mode", "navigate".parse().unwrap());
        headers.insert("sec-fetch-dest", "document".parse().unwrap());
        let uri: Uri = "/animals/7?tab=health".parse().unwrap();

        let request = to_fetch_request(&origin, &Method::GET, &uri, &headers, b"").unwrap();
        assert_eq!(request.url.as_str(), "http://farm.local/animals/7?tab=health");
        assert_eq!(request.mode, RequestMode::Navigate);
        assert_eq!(request.destination, Destination::Document);
        assert!(request.header("host").is_none());
        assert!(request.body.is_none());
    }

    #[tokio::test]
    async fn test_offline_navigation_serves_cached_shell() {
        let (app, _worker, fetcher, _temp) = gateway().await;
        fetcher.offline.store(true, Ordering::SeqCst);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sales/42")
                    .header("accept", "text/html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "page /");
    }

    #[tokio::test]
    async fn test_offline_mutation_is_queued() {
        let (app, worker, fetcher, _temp) = gateway().await;
        fetcher.offline.store(true, Ordering::SeqCst);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/animals")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"tag":"A12"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let id = response.headers()[QUEUED_HEADER].to_str().unwrap().to_string();
        let queued = worker.queue().get(&id).await.unwrap().unwrap();
        assert_eq!(queued.url, "http://farm.local/api/animals");
        assert_eq!(queued.body.as_deref(), Some(br#"{"tag":"A12"}"#.as_slice()));
    }

    #[tokio::test]
    async fn test_uncached_offline_navigation_gets_offline_document() {
        let temp_dir = TempDir::new().unwrap();
        let origin = Url::parse("http://farm.local").unwrap();
        let mut manager = ManagerConfig::new("v1", origin.clone());
        manager.precache = vec![];
        let fetcher = Arc::new(ToggleFetcher {
            offline: AtomicBool::new(true),
        });
        let worker = Arc::new(
            ServiceWorker::open(&temp_dir.path().join("worker.db"), WorkerConfig::new(manager), fetcher)
                .await
                .unwrap(),
        );
        worker.install().await.unwrap();
        worker.activate().await.unwrap();
        let (events, _rx) = mpsc::channel(4);
        let app = router(GatewayState {
            worker,
            events,
            origin,
        });

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("sec-fetch-mode", "navigate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["x-herdbook-response"], "synthetic");
        assert_eq!(body_text(response).await, OFFLINE_HTML);
    }

    #[tokio::test]
    async fn test_message_endpoint_forwards_command() {
        let temp_dir = TempDir::new().unwrap();
        let origin = Url::parse("http://farm.local").unwrap();
        let fetcher = Arc::new(ToggleFetcher {
            offline: AtomicBool::new(false),
        });
        let worker = Arc::new(
            ServiceWorker::open(
                &temp_dir.path().join("worker.db"),
                WorkerConfig::new(ManagerConfig::new("v1", origin.clone())),
                fetcher,
            )
            .await
            .unwrap(),
        );
        let (events, mut rx) = mpsc::channel(4);
        let app = router(GatewayState {
            worker,
            events,
            origin,
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/__herdbook/message")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"type":"SKIP_WAITING"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            rx.recv().await,
            Some(WorkerEvent::Message(WorkerCommand::SkipWaiting))
        );
    }
}
