//! The download coordinator: resolves a file's chunk placements and
//! streams them back to the caller in strict index order.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk_service::ChunkServiceClient;
use crate::error::{CoreError, CoreResult};
use crate::fault::FaultShell;
use crate::store::{FileRow, MetadataStore};

pub struct DownloadCoordinator {
    store: MetadataStore,
    fault_shell: Arc<FaultShell>,
    client: ChunkServiceClient,
}

impl DownloadCoordinator {
    pub fn new(store: MetadataStore, fault_shell: Arc<FaultShell>) -> Self {
        Self {
            store,
            fault_shell,
            client: ChunkServiceClient::default(),
        }
    }

    /// Resolve `file_id`'s metadata and chunk locations and return a
    /// byte stream that reads each chunk through the fault shell, in
    /// order. The stream yields `std::io::Error` on any failure, per
    /// axum's `Body::from_stream` contract; a mid-stream error aborts
    /// the response, matching the spec's truncated-transfer semantics.
    pub async fn download(
        &self,
        file_id: Uuid,
        cancel: CancellationToken,
    ) -> CoreResult<(FileRow, BoxStream<'static, Result<Bytes, std::io::Error>>)> {
        let file = self.store.get_file(file_id).await?;
        if file.status != "committed" {
            return Err(CoreError::Conflict(format!(
                "file {file_id} is not completed (status: {})",
                file.status
            )));
        }

        let chunks = self.store.get_chunks(file_id).await?;
        let fault_shell = self.fault_shell.clone();
        let client = self.client.clone();

        let body = stream::iter(chunks)
            .then(move |chunk| {
                let fault_shell = fault_shell.clone();
                let client = client.clone();
                let cancel = cancel.clone();
                async move {
                    let result = fault_shell
                        .call(&chunk.server_id, &cancel, || {
                            let client = client.clone();
                            let address = chunk.server_address.clone();
                            async move { client.get_stream(&address, chunk.id).await }
                        })
                        .await;

                    match result {
                        Ok(response) => response
                            .bytes_stream()
                            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)))
                            .boxed(),
                        Err(err) => {
                            stream::once(async move { Err(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())) })
                                .boxed()
                        }
                    }
                }
            })
            .flatten()
            .boxed();

        Ok((file, body))
    }
}
