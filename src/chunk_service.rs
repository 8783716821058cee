//! The chunk service: the four streamed operations (`PUT`, `GET`,
//! `DELETE`, `HEALTH`) a chunk server exposes, and the client used by
//! the router to reach them.
//!
//! Spec §4.5 describes these as a gRPC-style streamed wire protocol;
//! this deployment exposes them as plain HTTP endpoints on the same
//! axum stack the router's client surface uses, so there is exactly
//! one HTTP framework in the crate rather than two wire protocols.
//! Streaming survives as axum/reqwest body streaming rather than gRPC
//! stream frames.

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::fault::Attempt;

/// Directory fanout: `chunks/<first two hex chars>/<chunk_id>`.
fn chunk_path(data_dir: &Path, chunk_id: Uuid) -> PathBuf {
    let id = chunk_id.simple().to_string();
    data_dir.join("chunks").join(&id[0..2]).join(&id)
}

/// Sidecar holding the digest recorded at write time, so a later GET
/// can detect silent on-disk corruption instead of just re-hashing the
/// (possibly already-corrupted) bytes and trusting them.
fn checksum_path(data_dir: &Path, chunk_id: Uuid) -> PathBuf {
    let id = chunk_id.simple().to_string();
    data_dir.join("chunks").join(&id[0..2]).join(format!("{id}.sha256"))
}

// ---------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct ChunkServerState {
    pub data_dir: PathBuf,
}

pub fn router(state: ChunkServerState) -> axum::Router {
    axum::Router::new()
        .route("/chunks/:chunk_id", put(put_chunk).get(get_chunk).delete(delete_chunk))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct PutQuery {
    checksum: String,
}

async fn put_chunk(
    State(state): State<ChunkServerState>,
    AxumPath(chunk_id): AxumPath<Uuid>,
    axum::extract::Query(query): axum::extract::Query<PutQuery>,
    body: Body,
) -> Response {
    match put_chunk_inner(&state.data_dir, chunk_id, &query.checksum, body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => err.into_response(),
    }
}

async fn put_chunk_inner(
    data_dir: &Path,
    chunk_id: Uuid,
    expected_checksum: &str,
    body: Body,
) -> Result<(), crate::error::CoreError> {
    let final_path = chunk_path(data_dir, chunk_id);
    let dir = final_path.parent().expect("chunk path always has a parent");
    tokio::fs::create_dir_all(dir).await?;

    let temp_path = dir.join(format!("{}.tmp", chunk_id.simple()));
    let mut file = tokio::fs::File::create(&temp_path).await?;
    let mut hasher = Sha256::new();

    let mut stream = body.into_data_stream();
    while let Some(frame) = stream.next().await {
        let bytes: Bytes = frame.map_err(|e| crate::error::CoreError::Internal(e.to_string()))?;
        hasher.update(&bytes);
        file.write_all(&bytes).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    let actual = hex::encode(hasher.finalize());
    if actual != expected_checksum {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(crate::error::CoreError::DataLoss(format!(
            "checksum mismatch for chunk {chunk_id}: expected {expected_checksum}, got {actual}"
        )));
    }

    tokio::fs::write(checksum_path(data_dir, chunk_id), &actual).await?;
    tokio::fs::rename(&temp_path, &final_path).await?;
    Ok(())
}

async fn get_chunk(
    State(state): State<ChunkServerState>,
    AxumPath(chunk_id): AxumPath<Uuid>,
) -> Response {
    let path = chunk_path(&state.data_dir, chunk_id);

    // Verify before streaming, per the wire-protocol contract: a
    // damaged chunk must never be partially served.
    let mut verify_file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return crate::error::CoreError::NotFound(format!("chunk {chunk_id}")).into_response();
        }
        Err(e) => return crate::error::CoreError::from(e).into_response(),
    };

    let expected = match tokio::fs::read_to_string(checksum_path(&state.data_dir, chunk_id)).await {
        Ok(s) => s,
        Err(e) => return crate::error::CoreError::from(e).into_response(),
    };

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        use tokio::io::AsyncReadExt;
        let n = match verify_file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return crate::error::CoreError::from(e).into_response(),
        };
        hasher.update(&buf[..n]);
    }
    let digest = hex::encode(hasher.finalize());

    if digest != expected {
        return crate::error::CoreError::DataLoss(format!(
            "checksum mismatch for chunk {chunk_id} on read: expected {expected}, got {digest}"
        ))
        .into_response();
    }

    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => return crate::error::CoreError::from(e).into_response(),
    };
    let stream = tokio_util::io::ReaderStream::with_capacity(file, 64 * 1024);
    let body = Body::from_stream(stream);

    Response::builder()
        .status(StatusCode::OK)
        .header("x-chunk-checksum", digest)
        .body(body)
        .expect("static response parts are always valid")
}

async fn delete_chunk(
    State(state): State<ChunkServerState>,
    AxumPath(chunk_id): AxumPath<Uuid>,
) -> Response {
    let path = chunk_path(&state.data_dir, chunk_id);
    let result = match tokio::fs::remove_file(&path).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            crate::error::CoreError::NotFound(format!("chunk {chunk_id}")).into_response()
        }
        Err(e) => return crate::error::CoreError::from(e).into_response(),
    };
    let _ = tokio::fs::remove_file(checksum_path(&state.data_dir, chunk_id)).await;
    result
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    available: u64,
    used: u64,
    total: u64,
}

async fn health(State(state): State<ChunkServerState>) -> Response {
    match fs2_stats(&state.data_dir) {
        Ok((available, used, total)) => Json(HealthReport {
            status: "healthy",
            available,
            used,
            total,
        })
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthReport {
                status: "unhealthy",
                available: 0,
                used: 0,
                total: 0,
            }),
        )
            .into_response(),
    }
}

/// Best-effort directory size accounting. Without a statvfs binding in
/// the dependency set, `total`/`available` fall back to the sum of
/// stored chunk bytes vs. zero headroom; good enough for the liveness
/// signal `/health` needs, not a capacity planning tool.
fn fs2_stats(data_dir: &Path) -> std::io::Result<(u64, u64, u64)> {
    let mut used = 0u64;
    if data_dir.exists() {
        for entry in walk_files(data_dir)? {
            used += entry.metadata()?.len();
        }
    }
    Ok((0, used, used))
}

fn walk_files(root: &Path) -> std::io::Result<Vec<std::fs::DirEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(entry);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------

/// Thin HTTP client for the four chunk-service operations. Every
/// method classifies its own failure as [`Attempt::Retryable`] or
/// [`Attempt::Fatal`] so it can be handed straight to
/// [`crate::fault::FaultShell::call`].
#[derive(Clone)]
pub struct ChunkServiceClient {
    http: reqwest::Client,
}

impl Default for ChunkServiceClient {
    fn default() -> Self {
        Self {
            http: reqwest::Client::builder()
                .build()
                .expect("default reqwest client configuration is always valid"),
        }
    }
}

fn classify(err: reqwest::Error) -> crate::error::CoreError {
    if err.is_timeout() || err.is_connect() {
        crate::error::CoreError::ServerUnavailable(err.to_string())
    } else {
        crate::error::CoreError::Internal(err.to_string())
    }
}

fn is_retryable(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

impl ChunkServiceClient {
    pub async fn put(
        &self,
        address: &str,
        chunk_id: Uuid,
        checksum: &str,
        data: Bytes,
    ) -> Attempt<()> {
        let url = format!("http://{address}/chunks/{chunk_id}?checksum={checksum}");
        let response = match self.http.put(&url).body(data).send().await {
            Ok(r) => r,
            Err(e) if is_retryable(&e) => return Attempt::Retryable(classify(e)),
            Err(e) => return Attempt::Fatal(classify(e)),
        };

        if response.status().is_success() {
            Attempt::Ok(())
        } else if response.status() == reqwest::StatusCode::INTERNAL_SERVER_ERROR {
            let body = response.text().await.unwrap_or_default();
            if body.contains("data_loss") {
                Attempt::Fatal(crate::error::CoreError::DataLoss(body))
            } else {
                Attempt::Retryable(crate::error::CoreError::ServerUnavailable(body))
            }
        } else {
            Attempt::Retryable(crate::error::CoreError::ServerUnavailable(format!(
                "chunk server returned {}",
                response.status()
            )))
        }
    }

    /// Fetch a chunk's full bytes. Used by the reclamation path and
    /// tests; the download coordinator streams instead (see
    /// [`Self::get_stream`]).
    pub async fn get(&self, address: &str, chunk_id: Uuid) -> Attempt<Bytes> {
        let url = format!("http://{address}/chunks/{chunk_id}");
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) if is_retryable(&e) => return Attempt::Retryable(classify(e)),
            Err(e) => return Attempt::Fatal(classify(e)),
        };

        match response.status() {
            reqwest::StatusCode::OK => match response.bytes().await {
                Ok(b) => Attempt::Ok(b),
                Err(e) => Attempt::Retryable(classify(e)),
            },
            reqwest::StatusCode::NOT_FOUND => {
                Attempt::Fatal(crate::error::CoreError::NotFound(format!("chunk {chunk_id}")))
            }
            reqwest::StatusCode::INTERNAL_SERVER_ERROR => {
                Attempt::Fatal(crate::error::CoreError::DataLoss(format!("chunk {chunk_id}")))
            }
            other => Attempt::Retryable(crate::error::CoreError::ServerUnavailable(format!(
                "chunk server returned {other}"
            ))),
        }
    }

    /// Open a streaming GET, returning the raw response so the caller
    /// can forward its body without buffering the whole chunk.
    pub async fn get_stream(&self, address: &str, chunk_id: Uuid) -> Attempt<reqwest::Response> {
        let url = format!("http://{address}/chunks/{chunk_id}");
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) if is_retryable(&e) => return Attempt::Retryable(classify(e)),
            Err(e) => return Attempt::Fatal(classify(e)),
        };

        match response.status() {
            reqwest::StatusCode::OK => Attempt::Ok(response),
            reqwest::StatusCode::NOT_FOUND => {
                Attempt::Fatal(crate::error::CoreError::NotFound(format!("chunk {chunk_id}")))
            }
            reqwest::StatusCode::INTERNAL_SERVER_ERROR => {
                Attempt::Fatal(crate::error::CoreError::DataLoss(format!("chunk {chunk_id}")))
            }
            other => Attempt::Retryable(crate::error::CoreError::ServerUnavailable(format!(
                "chunk server returned {other}"
            ))),
        }
    }

    pub async fn delete(&self, address: &str, chunk_id: Uuid) -> Attempt<()> {
        let url = format!("http://{address}/chunks/{chunk_id}");
        let response = match self.http.delete(&url).send().await {
            Ok(r) => r,
            Err(e) if is_retryable(&e) => return Attempt::Retryable(classify(e)),
            Err(e) => return Attempt::Fatal(classify(e)),
        };

        match response.status() {
            reqwest::StatusCode::OK => Attempt::Ok(()),
            reqwest::StatusCode::NOT_FOUND => Attempt::Ok(()), // at-least-once reclamation: absorb
            other => Attempt::Retryable(crate::error::CoreError::ServerUnavailable(format!(
                "chunk server returned {other}"
            ))),
        }
    }

    /// Probe a chunk server's `/health` endpoint. Used by the
    /// connection-health loop to detect a dead or wedged server before
    /// a real upload/download request hits it.
    pub async fn health(&self, address: &str) -> Attempt<()> {
        let url = format!("http://{address}/health");
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) if is_retryable(&e) => return Attempt::Retryable(classify(e)),
            Err(e) => return Attempt::Fatal(classify(e)),
        };

        if response.status().is_success() {
            Attempt::Ok(())
        } else {
            Attempt::Retryable(crate::error::CoreError::ServerUnavailable(format!(
                "health probe returned {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chunk_path_uses_two_char_fanout() {
        let dir = tempdir().unwrap();
        let id = Uuid::nil();
        let path = chunk_path(dir.path(), id);
        assert!(path.ends_with("chunks/00000000000000000000000000000000"));
    }

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let chunk_id = Uuid::new_v4();
        let data = Bytes::from_static(b"hello chunk");
        let checksum = hex::encode(Sha256::digest(&data));

        put_chunk_inner(dir.path(), chunk_id, &checksum, Body::from(data.clone()))
            .await
            .unwrap();

        let path = chunk_path(dir.path(), chunk_id);
        let on_disk = tokio::fs::read(&path).await.unwrap();
        assert_eq!(on_disk, data.to_vec());

        let sidecar = tokio::fs::read_to_string(checksum_path(dir.path(), chunk_id))
            .await
            .unwrap();
        assert_eq!(sidecar, checksum);
    }

    #[tokio::test]
    async fn put_rejects_checksum_mismatch_and_cleans_up_temp_file() {
        let dir = tempdir().unwrap();
        let chunk_id = Uuid::new_v4();
        let data = Bytes::from_static(b"hello chunk");

        let result = put_chunk_inner(dir.path(), chunk_id, "not-the-real-checksum", Body::from(data)).await;
        assert!(matches!(result, Err(crate::error::CoreError::DataLoss(_))));

        let path = chunk_path(dir.path(), chunk_id);
        assert!(!path.exists());
        let temp_path = path.parent().unwrap().join(format!("{}.tmp", chunk_id.simple()));
        assert!(!temp_path.exists());
    }
}
