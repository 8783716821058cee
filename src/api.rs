//! The router's client HTTP surface: upload, download, metadata,
//! listing, deletion, and health.
//!
//! Grounded on the teacher's `api::routes` assembly idiom (a flat
//! `Router::new().route(...)` with shared state via `.with_state`,
//! cross-cutting concerns applied as `tower` layers) and
//! `api::responses`' pagination envelope shape, trimmed to the one
//! resource this deployment actually serves.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Multipart, Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::download::DownloadCoordinator;
use crate::error::{CoreError, CoreResult};
use crate::fault::FaultShell;
use crate::ring::PlacementRing;
use crate::store::MetadataStore;
use crate::upload::UploadCoordinator;

/// Shared state for every handler on the router's HTTP surface.
pub struct AppState {
    pub store: MetadataStore,
    pub ring: Arc<PlacementRing>,
    pub fault_shell: Arc<FaultShell>,
    pub upload: UploadCoordinator,
    pub download: DownloadCoordinator,
    pub upload_timeout: Duration,
    pub download_timeout: Duration,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/files", post(upload_file).get(list_files))
        .route("/files/:id", get(download_file).delete(delete_file))
        .route("/files/:id/metadata", get(file_metadata))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------
// POST /files
// ---------------------------------------------------------------------

async fn upload_file(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let field = match multipart.next_field().await {
        Ok(Some(field)) => field,
        Ok(None) => {
            return CoreError::InvalidInput("multipart form has no `file` field".into())
                .into_response()
        }
        Err(e) => return CoreError::InvalidInput(e.to_string()).into_response(),
    };

    let name = field
        .file_name()
        .map(str::to_string)
        .unwrap_or_else(|| "unnamed".to_string());
    let content_type = field
        .content_type()
        .map(str::to_string)
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let data: Bytes = match field.bytes().await {
        Ok(b) => b,
        Err(e) => return CoreError::InvalidInput(e.to_string()).into_response(),
    };

    let cancel = CancellationToken::new();
    let result = tokio::time::timeout(
        state.upload_timeout,
        state.upload.upload(&name, &content_type, data, cancel),
    )
    .await;

    let outcome = match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => return err.into_response(),
        Err(_) => return CoreError::ServerUnavailable("upload timed out".into()).into_response(),
    };

    (
        StatusCode::CREATED,
        Json(json!({
            "file_id": outcome.file_id,
            "filename": outcome.name,
            "content_type": outcome.content_type,
            "size": outcome.size,
            "checksum": outcome.checksum,
            "chunks": outcome.chunk_count,
            "status": "completed",
        })),
    )
        .into_response()
}

// ---------------------------------------------------------------------
// GET /files/{id}
// ---------------------------------------------------------------------

async fn download_file(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    let cancel = CancellationToken::new();
    let (file, body) = match tokio::time::timeout(
        state.download_timeout,
        state.download.download(id, cancel),
    )
    .await
    {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => return err.into_response(),
        Err(_) => return CoreError::ServerUnavailable("download timed out".into()).into_response(),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.content_type.clone())
        .header(header::CONTENT_LENGTH, file.size_bytes)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.name),
        )
        .body(Body::from_stream(body))
        .expect("static response parts are always valid")
}

// ---------------------------------------------------------------------
// GET /files/{id}/metadata
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChunkMetadata {
    index: i16,
    id: Uuid,
    size: i64,
    server_id: String,
}

async fn file_metadata(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    match fetch_metadata(&state, id).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn fetch_metadata(state: &AppState, id: Uuid) -> CoreResult<serde_json::Value> {
    let file = state.store.get_file(id).await?;
    let chunks = state.store.get_chunks(id).await?;
    Ok(json!({
        "file_id": file.id,
        "filename": file.name,
        "content_type": file.content_type,
        "size": file.size_bytes,
        "status": file.status,
        "checksum": file.checksum,
        "created_at": file.created_at,
        "committed_at": file.committed_at,
        "chunks": chunks.into_iter().map(|c| ChunkMetadata {
            index: c.chunk_index,
            id: c.id,
            size: c.size_bytes,
            server_id: c.server_id,
        }).collect::<Vec<_>>(),
    }))
}

// ---------------------------------------------------------------------
// GET /files
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListQuery {
    page: Option<u32>,
    per_page: Option<u32>,
}

async fn list_files(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> Response {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);

    let (files, total_count) = match state.store.list_files(page, per_page).await {
        Ok(result) => result,
        Err(err) => return err.into_response(),
    };

    let total_pages = (total_count as f64 / per_page as f64).ceil() as u64;

    Json(json!({
        "files": files.into_iter().map(|f| json!({
            "file_id": f.id,
            "filename": f.name,
            "content_type": f.content_type,
            "size": f.size_bytes,
            "status": f.status,
            "checksum": f.checksum,
            "created_at": f.created_at,
        })).collect::<Vec<_>>(),
        "pagination": {
            "page": page,
            "per_page": per_page,
            "total_count": total_count,
            "total_pages": total_pages.max(1),
        },
    }))
    .into_response()
}

// ---------------------------------------------------------------------
// DELETE /files/{id}
// ---------------------------------------------------------------------

async fn delete_file(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    let chunks = match state.store.delete_file(id).await {
        Ok(chunks) => chunks,
        Err(err) => return err.into_response(),
    };

    let client = crate::chunk_service::ChunkServiceClient::default();
    let cancel = CancellationToken::new();
    let mut deleted = 0u32;
    let mut failed = 0u32;
    for chunk in chunks {
        let result = state
            .fault_shell
            .call(&chunk.server_id, &cancel, || {
                let client = client.clone();
                let address = chunk.server_address.clone();
                let chunk_id = chunk.id;
                async move { client.delete(&address, chunk_id).await }
            })
            .await;
        match result {
            Ok(()) => deleted += 1,
            Err(_) => failed += 1,
        }
    }

    Json(json!({
        "file_id": id,
        "deleted_chunks": deleted,
        "failed_chunks": failed,
    }))
    .into_response()
}

// ---------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    storage_servers: usize,
    timestamp: DateTime<Utc>,
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let storage_servers = state.ring.server_count();
    let db_healthy = state.store.health_check().await;

    if storage_servers == 0 || !db_healthy {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthBody {
                status: "unhealthy",
                storage_servers,
                timestamp: Utc::now(),
            }),
        )
            .into_response();
    }

    Json(HealthBody {
        status: "healthy",
        storage_servers,
        timestamp: Utc::now(),
    })
    .into_response()
}
