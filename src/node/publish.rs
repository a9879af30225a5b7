use crate::client::Directory;
use crate::error::{Result, SwarmError};
use crate::models::FileId;
use crate::node::splitter::{chunk_count, split};
use crate::node::storage::ChunkStore;
use futures::{StreamExt, TryStreamExt};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFile {
    pub file_id: FileId,
    pub filename: String,
    pub total_chunks: u32,
    /// Chunks whose announcement failed; they stay stored locally.
    pub announce_failures: Vec<u32>,
}

/// Splits local files into the chunk store and announces them to the
/// tracker under this peer's endpoint.
pub struct Publisher {
    directory: Arc<dyn Directory>,
    store: ChunkStore,
    endpoint: String,
    chunk_size: usize,
    announce_concurrency: usize,
}

impl Publisher {
    pub fn new(
        directory: Arc<dyn Directory>,
        store: ChunkStore,
        endpoint: String,
        chunk_size: usize,
        announce_concurrency: usize,
    ) -> Self {
        Self {
            directory,
            store,
            endpoint,
            chunk_size,
            announce_concurrency: announce_concurrency.max(1),
        }
    }

    pub async fn share_file(&self, path: &Path) -> Result<PublishedFile> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| SwarmError::invalid(format!("{} has no file name", path.display())))?;
        let file_size = fs::metadata(path).await?.len();
        let total_chunks = chunk_count(file_size, self.chunk_size);
        if total_chunks == 0 {
            return Err(SwarmError::invalid(format!("{} is empty, nothing to share", filename)));
        }
        let total_chunks = u32::try_from(total_chunks)
            .map_err(|_| SwarmError::invalid(format!("{} needs too many chunks", filename)))?;
        info!("Sharing {} ({} bytes, {} chunks)", filename, file_size, total_chunks);

        let file_id = self.directory.register_file(&filename, i64::from(total_chunks)).await?;
        debug!("Tracker assigned file id {} to {}", file_id, filename);

        // every chunk is on disk before any announcement makes it fetchable
        let stored = self.store_chunks(file_id, path).await?;
        if stored != total_chunks {
            return Err(SwarmError::invalid(format!(
                "{} changed while sharing: expected {} chunks, read {}",
                filename, total_chunks, stored
            )));
        }

        let announce_failures = self.announce_all(file_id, total_chunks).await;
        if !announce_failures.is_empty() {
            warn!(
                "File {} shared with {} unannounced chunks: {:?}",
                file_id,
                announce_failures.len(),
                announce_failures
            );
        }

        metrics::counter!("files_published_total").increment(1);
        info!("File sharing complete. File ID: {}", file_id);
        Ok(PublishedFile {
            file_id,
            filename,
            total_chunks,
            announce_failures,
        })
    }

    async fn store_chunks(&self, file_id: FileId, path: &Path) -> Result<u32> {
        let file = fs::File::open(path).await?;
        let chunks = split(file, self.chunk_size)?;
        futures::pin_mut!(chunks);

        let mut stored = 0;
        while let Some(chunk) = chunks.try_next().await? {
            debug!(
                "Processing chunk {}, size: {} bytes, sha256: {}",
                chunk.index,
                chunk.len(),
                chunk.checksum()
            );
            self.store.put_chunk(file_id, chunk.index, &chunk.data).await?;
            stored += 1;
        }
        Ok(stored)
    }

    /// Announces every chunk independently; returns the indices that failed.
    async fn announce_all(&self, file_id: FileId, total_chunks: u32) -> Vec<u32> {
        let mut failures: Vec<u32> = futures::stream::iter(0..total_chunks)
            .map(|index| async move {
                match self.directory.announce_chunk(file_id, index, &self.endpoint).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("Failed to announce chunk {} of file {}: {}", index, file_id, e);
                        Some(index)
                    }
                }
            })
            .buffer_unordered(self.announce_concurrency)
            .filter_map(|failed| async move { failed })
            .collect()
            .await;
        failures.sort_unstable();
        failures
    }
}
