//! Membership: who is on the ring, and how the cluster finds out.
//!
//! Grounded on the teacher's `enterprise::cluster::membership::MembershipManager`
//! for the shape (a manager owning a periodic background loop that
//! reconciles a live member set) but not its mechanism: that manager
//! runs a SWIM-like gossip protocol between peers, while this one has
//! no peer-to-peer messaging at all — every chunk server heartbeats
//! into the shared [`crate::store::MetadataStore`], and every router
//! independently polls it, matching the heartbeat/poll membership
//! protocol.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::chunk_service::ChunkServiceClient;
use crate::fault::FaultShell;
use crate::ring::PlacementRing;
use crate::store::MetadataStore;

/// Chunk-server side: register once, then heartbeat forever until
/// cancelled. Runs for the lifetime of the chunk-server process.
pub async fn run_heartbeat_loop(
    store: MetadataStore,
    server_id: String,
    address: String,
    interval: Duration,
    virtual_nodes: usize,
    cancel: CancellationToken,
) {
    register(&store, &server_id, &address, virtual_nodes).await;

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = store.heartbeat(&server_id).await {
                    tracing::warn!("heartbeat failed, re-registering: {err}");
                    register(&store, &server_id, &address, virtual_nodes).await;
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("heartbeat loop shutting down for server {server_id}");
                return;
            }
        }
    }
}

/// Register (or re-register) with the metadata store: upsert the
/// `servers` row, then delete and re-create this server's 150
/// `ring_nodes` rows, per the membership protocol's registration step.
async fn register(store: &MetadataStore, server_id: &str, address: &str, virtual_nodes: usize) {
    if let Err(err) = store.upsert_server(server_id, address).await {
        tracing::error!("server registration failed: {err}");
        return;
    }
    let nodes = crate::ring::virtual_node_hashes(server_id, virtual_nodes);
    if let Err(err) = store.replace_ring_nodes(server_id, &nodes).await {
        tracing::error!("ring node persistence failed: {err}");
    }
}

/// Router side: periodically reconcile the placement ring against the
/// set of servers with a heartbeat newer than `heartbeat_timeout`.
/// Newly live servers are added, servers that dropped out are removed
/// (and their circuit breaker forgotten, so a later rejoin starts
/// Closed rather than inheriting stale Open state).
pub async fn run_ring_refresh_loop(
    store: MetadataStore,
    ring: std::sync::Arc<PlacementRing>,
    fault_shell: std::sync::Arc<FaultShell>,
    heartbeat_timeout: Duration,
    refresh_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(refresh_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                reconcile(&store, &ring, &fault_shell, heartbeat_timeout).await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("ring refresh loop shutting down");
                return;
            }
        }
    }
}

/// Router side: every `interval`, probe each registered server's
/// `/health` endpoint through the fault shell. This is the HTTP
/// analogue of the gRPC transport-state watcher — there is no
/// per-connection transport state to inspect with a pooled HTTP
/// client, so "tear down and redial" becomes "feed the probe's
/// outcome into the same breaker a real request would use", which
/// trips the breaker on a wedged server before a real upload or
/// download request pays for the discovery. Probes run concurrently
/// and never block a lookup.
pub async fn run_connection_health_loop(
    ring: std::sync::Arc<PlacementRing>,
    fault_shell: std::sync::Arc<FaultShell>,
    client: ChunkServiceClient,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => probe_all(&ring, &fault_shell, &client, &cancel).await,
            _ = cancel.cancelled() => {
                tracing::info!("connection health loop shutting down");
                return;
            }
        }
    }
}

async fn probe_all(
    ring: &PlacementRing,
    fault_shell: &FaultShell,
    client: &ChunkServiceClient,
    cancel: &CancellationToken,
) {
    let servers = ring.servers();
    let probes = servers.into_iter().map(|(server_id, address)| {
        let fault_shell = fault_shell.clone();
        let client = client.clone();
        let cancel = cancel.clone();
        async move {
            let result = fault_shell
                .call(&server_id, &cancel, || {
                    let client = client.clone();
                    let address = address.clone();
                    async move { client.health(&address).await }
                })
                .await;
            if let Err(err) = result {
                tracing::warn!(server_id, "connection health probe failed: {err}");
            }
        }
    });
    futures::future::join_all(probes).await;
}

async fn reconcile(
    store: &MetadataStore,
    ring: &PlacementRing,
    fault_shell: &FaultShell,
    heartbeat_timeout: Duration,
) {
    let live = match store.live_servers(heartbeat_timeout).await {
        Ok(rows) => rows,
        Err(err) => {
            tracing::error!("failed to load live servers: {err}");
            return;
        }
    };

    let live_ids: std::collections::HashSet<String> =
        live.iter().map(|s| s.id.clone()).collect();

    for server in &live {
        ring.add(&server.id, &server.address);
    }

    for (server_id, _) in ring.servers() {
        if !live_ids.contains(&server_id) {
            tracing::warn!(server_id, "server dropped from ring: heartbeat expired");
            ring.remove(&server_id);
            fault_shell.remove(&server_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_add_and_remove_round_trip() {
        let ring = PlacementRing::default();
        ring.add("s1", "127.0.0.1:9090");
        assert!(ring.contains("s1"));
        ring.remove("s1");
        assert!(!ring.contains("s1"));
    }
}
