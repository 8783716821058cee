//! Router binary: client HTTP surface, placement ring, and the
//! membership/reclamation background loops.

use std::sync::Arc;

use hexstore::api::{self, AppState};
use hexstore::chunk_service::ChunkServiceClient;
use hexstore::config::RouterConfig;
use hexstore::download::DownloadCoordinator;
use hexstore::fault::FaultShell;
use hexstore::membership;
use hexstore::reclamation::ReclamationWorker;
use hexstore::ring::PlacementRing;
use hexstore::store::MetadataStore;
use hexstore::upload::UploadCoordinator;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RouterConfig::from_env()?;
    let store = MetadataStore::connect(&config.database).await?;
    let ring = Arc::new(PlacementRing::new(config.virtual_nodes_per_server));
    let fault_shell = Arc::new(FaultShell::default());

    let cancel = CancellationToken::new();

    let upload = UploadCoordinator::new(store.clone(), ring.clone(), fault_shell.clone(), config.session_ttl);
    let download = DownloadCoordinator::new(store.clone(), fault_shell.clone());
    let state = Arc::new(AppState {
        store: store.clone(),
        ring: ring.clone(),
        fault_shell: fault_shell.clone(),
        upload,
        download,
        upload_timeout: config.upload_timeout,
        download_timeout: config.download_timeout,
    });

    let ring_task = tokio::spawn(membership::run_ring_refresh_loop(
        store.clone(),
        ring.clone(),
        fault_shell.clone(),
        config.heartbeat_timeout,
        config.ring_refresh_interval,
        cancel.clone(),
    ));

    let health_task = tokio::spawn(membership::run_connection_health_loop(
        ring.clone(),
        fault_shell.clone(),
        ChunkServiceClient::default(),
        config.connection_health_interval,
        cancel.clone(),
    ));

    let reclamation = ReclamationWorker::new(
        store.clone(),
        ring.clone(),
        fault_shell.clone(),
        config.reclamation_delete_timeout,
    );
    let reclamation_task = tokio::spawn(reclamation.run(config.reclamation_interval, cancel.clone()));

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "router listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    let _ = ring_task.await;
    let _ = health_task.await;
    let _ = reclamation_task.await;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    cancel.cancel();
}
