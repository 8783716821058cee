//! End-to-end exercise of the chunk service HTTP surface: a real
//! axum server bound to a loopback port, driven with `reqwest`, the
//! same way the upload/download coordinators talk to it in
//! production.

use hexstore::chunk_service::{router, ChunkServerState};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use uuid::Uuid;

async fn spawn_server() -> (String, PathBuf, tokio::task::JoinHandle<()>) {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_path_buf();
    let state = ChunkServerState {
        data_dir: data_dir.clone(),
    };
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    // keep the tempdir alive for the server's lifetime by leaking it;
    // the OS reclaims it on process exit, which is fine for a test.
    std::mem::forget(dir);
    (addr.to_string(), data_dir, handle)
}

fn chunk_path(data_dir: &std::path::Path, chunk_id: Uuid) -> PathBuf {
    let id = chunk_id.simple().to_string();
    data_dir.join("chunks").join(&id[0..2]).join(&id)
}

#[tokio::test]
async fn put_get_delete_round_trip() {
    let (addr, _data_dir, _handle) = spawn_server().await;
    let client = reqwest::Client::new();
    let chunk_id = Uuid::new_v4();
    let data = b"the quick brown fox jumps over the lazy dog".to_vec();
    let checksum = hex::encode(Sha256::digest(&data));

    let put_resp = client
        .put(format!("http://{addr}/chunks/{chunk_id}?checksum={checksum}"))
        .body(data.clone())
        .send()
        .await
        .unwrap();
    assert!(put_resp.status().is_success());

    let get_resp = client
        .get(format!("http://{addr}/chunks/{chunk_id}"))
        .send()
        .await
        .unwrap();
    assert!(get_resp.status().is_success());
    let body = get_resp.bytes().await.unwrap();
    assert_eq!(body.to_vec(), data);

    let delete_resp = client
        .delete(format!("http://{addr}/chunks/{chunk_id}"))
        .send()
        .await
        .unwrap();
    assert!(delete_resp.status().is_success());

    let get_after_delete = client
        .get(format!("http://{addr}/chunks/{chunk_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(get_after_delete.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn put_with_wrong_checksum_is_rejected() {
    let (addr, _data_dir, _handle) = spawn_server().await;
    let client = reqwest::Client::new();
    let chunk_id = Uuid::new_v4();

    let put_resp = client
        .put(format!("http://{addr}/chunks/{chunk_id}?checksum=deadbeef"))
        .body(b"mismatched".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(put_resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

    let get_resp = client
        .get(format!("http://{addr}/chunks/{chunk_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(get_resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_on_empty_data_dir() {
    let (addr, _data_dir, _handle) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("http://{addr}/health")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn get_after_on_disk_corruption_returns_data_loss() {
    let (addr, data_dir, _handle) = spawn_server().await;
    let client = reqwest::Client::new();
    let chunk_id = Uuid::new_v4();
    let data = b"the quick brown fox jumps over the lazy dog".to_vec();
    let checksum = hex::encode(Sha256::digest(&data));

    let put_resp = client
        .put(format!("http://{addr}/chunks/{chunk_id}?checksum={checksum}"))
        .body(data.clone())
        .send()
        .await
        .unwrap();
    assert!(put_resp.status().is_success());

    // Flip a byte directly on disk, bypassing the write path entirely,
    // to simulate silent storage-layer corruption.
    let path = chunk_path(&data_dir, chunk_id);
    let mut bytes = tokio::fs::read(&path).await.unwrap();
    bytes[0] ^= 0xFF;
    tokio::fs::write(&path, &bytes).await.unwrap();

    let get_resp = client
        .get(format!("http://{addr}/chunks/{chunk_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(get_resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = get_resp.json().await.unwrap();
    assert_eq!(body["error"], "data_loss");
}
