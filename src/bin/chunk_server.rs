//! Chunk server binary: the PUT/GET/DELETE/HEALTH surface and the
//! heartbeat loop that keeps this server visible to routers.

use hexstore::chunk_service::{self, ChunkServerState};
use hexstore::config::ChunkServerConfig;
use hexstore::store::MetadataStore;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ChunkServerConfig::from_env()?;
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let store = MetadataStore::connect(&config.database).await?;
    let cancel = CancellationToken::new();

    let address = format!("127.0.0.1:{}", config.grpc_port);
    let heartbeat_task = tokio::spawn(hexstore::membership::run_heartbeat_loop(
        store.clone(),
        config.server_id.clone(),
        address,
        config.heartbeat_interval,
        config.virtual_nodes_per_server,
        cancel.clone(),
    ));

    let state = ChunkServerState {
        data_dir: config.data_dir.clone(),
    };
    let app = chunk_service::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.grpc_port)).await?;
    tracing::info!(server_id = %config.server_id, port = config.grpc_port, "chunk server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    let _ = heartbeat_task.await;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    cancel.cancel();
}
