//! Uploads one asset: resolve it, push it through a resumable session, and
//! report every step back to the batch coordinator.

use crate::config::QueueConfig;
use crate::errors::TransferError;
use crate::models::{
    asset::AssetRef,
    metadata::UploadMetadata,
    transfer::{ObjectKey, TransferState},
};
use crate::services::{
    asset_resolver::AssetResolver,
    object_store::{ObjectStore, StorageError},
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Event streamed from an executor to its coordinator.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Entered `Resolving` or `Uploading`.
    Phase { index: usize, state: TransferState },
    /// Committed bytes over total bytes, in percent.
    Progress { index: usize, percent: f64 },
    /// Terminal result: the download URL or the reason it failed.
    Finished {
        index: usize,
        result: Result<String, TransferError>,
    },
}

/// Everything an executor needs to upload one file.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub index: usize,
    pub asset: AssetRef,
    pub key: ObjectKey,
    pub metadata: UploadMetadata,
}

#[derive(Clone)]
pub struct TransferExecutor {
    store: Arc<dyn ObjectStore>,
    resolver: Arc<dyn AssetResolver>,
    config: QueueConfig,
}

impl TransferExecutor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        resolver: Arc<dyn AssetResolver>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            resolver,
            config,
        }
    }

    /// Run the job to a terminal state. The result is also sent as
    /// [`TransferEvent::Finished`]; a closed channel is ignored.
    pub async fn execute(
        &self,
        job: TransferJob,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<String, TransferError> {
        let result = self.run(&job, &events).await;
        if let Err(err) = &result {
            warn!(key = %job.key, asset = %job.asset, "transfer failed: {err}");
        }
        let _ = events.send(TransferEvent::Finished {
            index: job.index,
            result: result.clone(),
        });
        result
    }

    async fn run(
        &self,
        job: &TransferJob,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<String, TransferError> {
        let index = job.index;
        let _ = events.send(TransferEvent::Phase {
            index,
            state: TransferState::Resolving,
        });
        let resolved = self.resolver.resolve(&job.asset).await?;

        let _ = events.send(TransferEvent::Phase {
            index,
            state: TransferState::Uploading,
        });
        let mut metadata = job.metadata.clone();
        if metadata.content_type.is_none() {
            metadata.content_type = Some(resolved.content_type.clone());
        }

        let total = resolved.bytes.len() as u64;
        let session = self
            .store
            .begin_upload(job.key.as_str(), total, &metadata)
            .await
            .map_err(|err| failed(&job.key, err))?;

        let committed = self
            .commit(&session.upload_id, job, &resolved.bytes, events)
            .await;
        if committed.is_err() {
            if let Err(err) = self.store.abort_upload(&session.upload_id).await {
                debug!(key = %job.key, "could not discard upload session: {err}");
            }
        }
        committed?;

        self.store
            .download_url(job.key.as_str())
            .await
            .map_err(|err| failed(&job.key, err))
    }

    async fn commit(
        &self,
        upload_id: &str,
        job: &TransferJob,
        bytes: &Bytes,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<(), TransferError> {
        self.send_chunks(upload_id, job, bytes, events).await?;
        self.store
            .finish_upload(upload_id)
            .await
            .map(|_| ())
            .map_err(|err| failed(&job.key, err))
    }

    /// Send the payload in `chunk_size` slices.
    ///
    /// A transient error rewinds to the store's committed offset and resends
    /// from there, at most `chunk_retries` times without forward progress.
    async fn send_chunks(
        &self,
        upload_id: &str,
        job: &TransferJob,
        bytes: &Bytes,
        events: &mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<(), TransferError> {
        let total = bytes.len() as u64;
        let chunk_size = self.config.chunk_size.max(1) as u64;
        let mut offset = 0u64;
        let mut retries_left = self.config.chunk_retries;

        while offset < total {
            let end = (offset + chunk_size).min(total);
            let chunk = bytes.slice(offset as usize..end as usize);

            match self.store.upload_chunk(upload_id, offset, chunk).await {
                Ok(committed) => {
                    offset = committed.min(total);
                    retries_left = self.config.chunk_retries;
                    let percent = offset as f64 * 100.0 / total as f64;
                    debug!(key = %job.key, offset, total, "chunk committed");
                    let _ = events.send(TransferEvent::Progress {
                        index: job.index,
                        percent,
                    });
                }
                Err(err) if err.is_transient() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(
                        key = %job.key,
                        offset,
                        retries_left,
                        "chunk failed, resuming: {err}"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                    offset = match err {
                        StorageError::OffsetMismatch { expected, .. } => expected,
                        _ => self
                            .store
                            .committed_offset(upload_id)
                            .await
                            .map_err(|err| failed(&job.key, err))?,
                    }
                    .min(total);
                }
                Err(err) => return Err(failed(&job.key, err)),
            }
        }
        Ok(())
    }
}

fn failed(key: &ObjectKey, err: StorageError) -> TransferError {
    TransferError::transfer_failed(key, err.to_string())
}
