//! The reclamation worker: a periodic sweep that deletes chunks and
//! metadata belonging to upload sessions that never finalized before
//! their TTL.
//!
//! Grounded on the teacher's `scheduling::worker` background-loop
//! shape (a singleton task, periodic tick, per-item failure logged
//! and tolerated rather than aborting the sweep) with the Redis-backed
//! job queue replaced by a direct query against the metadata store —
//! reclamation here has no job payload to dequeue, only a time
//! predicate (`expires_at < now`) to re-evaluate each tick.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk_service::ChunkServiceClient;
use crate::fault::FaultShell;
use crate::ring::PlacementRing;
use crate::store::MetadataStore;

pub struct ReclamationWorker {
    store: MetadataStore,
    ring: Arc<PlacementRing>,
    fault_shell: Arc<FaultShell>,
    client: ChunkServiceClient,
    delete_timeout: Duration,
}

impl ReclamationWorker {
    pub fn new(
        store: MetadataStore,
        ring: Arc<PlacementRing>,
        fault_shell: Arc<FaultShell>,
        delete_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ring,
            fault_shell,
            client: ChunkServiceClient::default(),
            delete_timeout,
        }
    }

    /// Run the sweep once, at startup and then every `interval` until
    /// `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        self.sweep().await;

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = cancel.cancelled() => {
                    tracing::info!("reclamation worker shutting down");
                    return;
                }
            }
        }
    }

    async fn sweep(&self) {
        let sessions = match self.store.expired_sessions().await {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::error!("failed to list expired sessions: {err}");
                return;
            }
        };

        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "reclaiming expired upload sessions");

        for session in sessions {
            self.reclaim_one(session.file_id, &session.chunks).await;
        }
    }

    async fn reclaim_one(&self, file_id: Uuid, chunks: &[crate::store::ChunkRow]) {
        for chunk in chunks {
            if !self.ring.contains(&chunk.server_id) {
                tracing::warn!(
                    chunk_id = %chunk.id,
                    server_id = %chunk.server_id,
                    "owning server unknown to the ring, chunk left as disk garbage"
                );
                continue;
            }

            let cancel = CancellationToken::new();
            let delete_timeout = self.delete_timeout;
            let address = chunk.server_address.clone();
            let chunk_id = chunk.id;
            let server_id = chunk.server_id.clone();
            let client = self.client.clone();

            let outcome = tokio::time::timeout(
                delete_timeout,
                self.fault_shell.call(&server_id, &cancel, || {
                    let client = client.clone();
                    let address = address.clone();
                    async move { client.delete(&address, chunk_id).await }
                }),
            )
            .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(chunk_id = %chunk_id, "chunk delete failed, left as disk garbage: {err}")
                }
                Err(_) => {
                    tracing::warn!(chunk_id = %chunk_id, "chunk delete timed out, left as disk garbage")
                }
            }
        }

        if let Err(err) = self.store.reclaim_file(file_id).await {
            tracing::error!(file_id = %file_id, "failed to delete reclaimed file row: {err}");
        }
    }
}
