//! The Herdbook backend: the remote side of replication and the target of
//! replayed offline writes.

pub mod auth;
pub mod routes;
pub mod storage;

pub use storage::{RemoteStore, StorageError};

use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::ApiKeyStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<ApiKeyStore>,
    pub store: RemoteStore,
}

/// Errors surfaced by handlers
#[derive(Debug)]
pub enum ServerError {
    InvalidCollection(String),
    BadRequest(String),
    NotFound { collection: String, id: String },
    Storage(StorageError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::InvalidCollection(name) => write!(f, "Invalid collection name: {}", name),
            ServerError::BadRequest(msg) => write!(f, "{}", msg),
            ServerError::NotFound { collection, id } => {
                write!(f, "Document '{}' not found in '{}'", id, collection)
            }
            ServerError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for ServerError {
    fn from(e: StorageError) -> Self {
        ServerError::Storage(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ServerError::InvalidCollection(_) => (StatusCode::BAD_REQUEST, "invalid_collection"),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServerError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ServerError::Storage(e) => {
                tracing::error!("storage failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_error")
            }
        };
        let body = ErrorBody {
            error,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Builds the full router: `/health` is public, everything else needs a key.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(routes::health));

    let protected_routes = Router::new()
        .route("/me", get(routes::me))
        .route("/api/collections/{collection}/pull", get(routes::pull))
        .route("/api/collections/{collection}/push", post(routes::push))
        .route("/api/collections/{collection}/count", get(routes::count))
        .route("/api/{collection}", post(routes::create))
        .route(
            "/api/{collection}/{id}",
            put(routes::replace).delete(routes::remove),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use herdbook_core::replication::ReplicationHandle;
    use herdbook_core::{HttpRemote, LocalStore, RemoteSource, Replicator};

    const KEY: &str = "test-key";

    async fn test_app() -> (Router, TempDir) {
        let (store, temp_dir) = storage::tests::test_store().await;
        let api_keys = ApiKeyStore::default()
            .with_key(KEY, "rancher", "farm-1")
            .with_key("other-key", "neighbour", "farm-2");
        let state = AppState {
            api_keys: Arc::new(api_keys),
            store,
        };
        (router(state), temp_dir)
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", KEY));
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let (app, _temp) = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_me_requires_valid_key() {
        let (app, _temp) = test_app().await;

        let missing = app
            .clone()
            .oneshot(Request::builder().uri("/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong_scheme = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/me")
                    .header("authorization", "Basic abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong_scheme.status(), StatusCode::UNAUTHORIZED);

        let ok = app.oneshot(request("GET", "/me", None)).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(
            json_body(ok).await,
            json!({"user_id": "rancher", "farm_id": "farm-1"})
        );
    }

    #[tokio::test]
    async fn test_invalid_collection_is_bad_request() {
        let (app, _temp) = test_app().await;
        let response = app
            .oneshot(request("GET", "/api/collections/Bad.Name/count", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid_collection");
    }

    #[tokio::test]
    async fn test_rest_mutations_are_idempotent() {
        let (app, _temp) = test_app().await;

        let created = app
            .clone()
            .oneshot(request("POST", "/api/animals", Some(json!({"id": "cow-1", "tag": "A12"}))))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        // A replayed create lands on the same document
        let replayed = app
            .clone()
            .oneshot(request("POST", "/api/animals", Some(json!({"id": "cow-1", "tag": "A12"}))))
            .await
            .unwrap();
        assert_eq!(replayed.status(), StatusCode::CREATED);

        let count = app
            .clone()
            .oneshot(request("GET", "/api/collections/animals/count", None))
            .await
            .unwrap();
        assert_eq!(json_body(count).await, json!({"count": 1}));

        let replaced = app
            .clone()
            .oneshot(request("PUT", "/api/animals/cow-1", Some(json!({"tag": "B7"}))))
            .await
            .unwrap();
        assert_eq!(replaced.status(), StatusCode::OK);
        assert_eq!(json_body(replaced).await["data"]["tag"], "B7");

        for _ in 0..2 {
            let deleted = app
                .clone()
                .oneshot(request("DELETE", "/api/animals/cow-1", None))
                .await
                .unwrap();
            assert_eq!(deleted.status(), StatusCode::OK);
        }

        let missing = app
            .oneshot(request("DELETE", "/api/animals/ghost", None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pull_rejects_malformed_cursor() {
        let (app, _temp) = test_app().await;
        let response = app
            .oneshot(request(
                "GET",
                "/api/collections/animals/pull?since=2025-03-01T00:00:00Z",
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pull_resumes_from_sequence() {
        let (app, _temp) = test_app().await;
        for id in ["cow-1", "cow-2"] {
            app.clone()
                .oneshot(request("PUT", &format!("/api/animals/{}", id), Some(json!({}))))
                .await
                .unwrap();
        }

        let first = app
            .clone()
            .oneshot(request("GET", "/api/collections/animals/pull?limit=1", None))
            .await
            .unwrap();
        let first = json_body(first).await;
        assert_eq!(first["documents"][0]["id"], "cow-1");
        let since = first["checkpoint"]["sequence"].as_u64().unwrap();

        let rest = app
            .oneshot(request(
                "GET",
                &format!("/api/collections/animals/pull?since={}", since),
                None,
            ))
            .await
            .unwrap();
        let rest = json_body(rest).await;
        assert_eq!(rest["documents"].as_array().unwrap().len(), 1);
        assert_eq!(rest["documents"][0]["id"], "cow-2");
    }

    #[tokio::test]
    async fn test_farms_do_not_see_each_other() {
        let (app, _temp) = test_app().await;
        app.clone()
            .oneshot(request("PUT", "/api/sales/s-1", Some(json!({"total": 10}))))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/collections/sales/count")
                    .header("authorization", "Bearer other-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(response).await, json!({"count": 0}));
    }

    /// Serves the router on an ephemeral port.
    async fn spawn_server() -> (String, TempDir) {
        let (app, temp_dir) = test_app().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), temp_dir)
    }

    #[tokio::test]
    async fn test_two_devices_converge_through_the_server() {
        let (url, _server_temp) = spawn_server().await;
        let remote: Arc<dyn RemoteSource> =
            Arc::new(HttpRemote::new(url.clone(), KEY.to_string()).unwrap());

        let device_dir = TempDir::new().unwrap();
        let phone = LocalStore::open(&device_dir.path().join("phone.db")).await.unwrap();
        let laptop = LocalStore::open(&device_dir.path().join("laptop.db")).await.unwrap();

        let phone_sync = ReplicationHandle::new("animals", phone.clone(), remote.clone())
            .unwrap()
            .with_batch_size(2);
        let laptop_sync = ReplicationHandle::new("animals", laptop.clone(), remote.clone())
            .unwrap()
            .with_batch_size(2);

        for i in 0..5 {
            phone
                .write("animals", &format!("cow-{}", i), json!({"n": i}))
                .await
                .unwrap();
        }
        phone.soft_delete("animals", "cow-0").await.unwrap();

        let pushed = phone_sync.re_sync().await.unwrap();
        assert_eq!(pushed.pushed, 5);

        laptop_sync.re_sync().await.unwrap();
        assert_eq!(laptop.count("animals").await.unwrap(), 4);
        assert!(laptop.get("animals", "cow-0").await.unwrap().unwrap().deleted);

        // A newer edit on the laptop wins on the phone
        laptop
            .write("animals", "cow-1", json!({"n": 100}))
            .await
            .unwrap();
        laptop_sync.re_sync().await.unwrap();
        phone_sync.re_sync().await.unwrap();
        assert_eq!(
            phone.get("animals", "cow-1").await.unwrap().unwrap().data,
            json!({"n": 100})
        );

        // Nothing left to move
        let idle = phone_sync.re_sync().await.unwrap();
        assert_eq!(idle.pushed, 0);
        assert_eq!(idle.applied, 0);

        let identity = HttpRemote::new(url, KEY.to_string())
            .unwrap()
            .fetch_identity()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.farm_id, "farm-1");
    }
}
