//! HTTP handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use herdbook_core::document::is_valid_collection_name;
use herdbook_core::{Checkpoint, CountResponse, LocalDocument, PullBatch, PushRequest, PushResult};

use super::{AppState, ServerError};
use crate::config::AuthUser;

const DEFAULT_PULL_LIMIT: usize = 100;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required)
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Current user response
#[derive(Serialize)]
pub struct MeResponse {
    user_id: String,
    farm_id: String,
}

/// Get current user info (auth required)
pub async fn me(Extension(user): Extension<AuthUser>) -> Json<MeResponse> {
    Json(MeResponse {
        user_id: user.user_id,
        farm_id: user.farm_id,
    })
}

fn check_collection(collection: &str) -> Result<(), ServerError> {
    if is_valid_collection_name(collection) {
        Ok(())
    } else {
        Err(ServerError::InvalidCollection(collection.to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct PullParams {
    limit: Option<usize>,
    /// Sequence of the last document already pulled
    since: Option<u64>,
}

pub async fn pull(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(collection): Path<String>,
    Query(params): Query<PullParams>,
) -> Result<Json<PullBatch>, ServerError> {
    check_collection(&collection)?;
    let cursor = params.since.map(|sequence| Checkpoint { sequence });
    let limit = params.limit.unwrap_or(DEFAULT_PULL_LIMIT);

    let batch = state
        .store
        .pull(&user.farm_id, &collection, cursor.as_ref(), limit)
        .await?;
    tracing::debug!(farm = %user.farm_id, %collection, documents = batch.documents.len(), "pull");
    Ok(Json(batch))
}

pub async fn push(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(collection): Path<String>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResult>, ServerError> {
    check_collection(&collection)?;
    let result = state
        .store
        .push(&user.farm_id, &collection, &request.documents)
        .await?;
    tracing::debug!(
        farm = %user.farm_id,
        %collection,
        accepted = result.accepted,
        rejected = result.rejected,
        "push"
    );
    Ok(Json(result))
}

pub async fn count(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(collection): Path<String>,
) -> Result<Json<CountResponse>, ServerError> {
    check_collection(&collection)?;
    let count = state.store.count(&user.farm_id, &collection).await?;
    Ok(Json(CountResponse { count }))
}

/// `POST /api/{collection}`. A client-chosen `id` in the body makes retries
/// land on the same document.
pub async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(collection): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<LocalDocument>), ServerError> {
    check_collection(&collection)?;
    if !body.is_object() {
        return Err(ServerError::BadRequest("Body must be a JSON object".to_string()));
    }
    let id = match body.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(_) => return Err(ServerError::BadRequest("id must be a non-empty string".to_string())),
        None => uuid::Uuid::new_v4().to_string(),
    };

    let doc = state.store.upsert(&user.farm_id, &collection, &id, body).await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

/// `PUT /api/{collection}/{id}`: replaces the document.
pub async fn replace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((collection, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<LocalDocument>, ServerError> {
    check_collection(&collection)?;
    let doc = state.store.upsert(&user.farm_id, &collection, &id, body).await?;
    Ok(Json(doc))
}

/// `DELETE /api/{collection}/{id}`: tombstones the document.
pub async fn remove(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<LocalDocument>, ServerError> {
    check_collection(&collection)?;
    match state.store.soft_delete(&user.farm_id, &collection, &id).await? {
        Some(doc) => Ok(Json(doc)),
        None => Err(ServerError::NotFound { collection, id }),
    }
}
