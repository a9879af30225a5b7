pub mod jobs;
pub mod publish;
pub mod retrieve;
pub mod splitter;
pub mod storage;

use crate::client::{http_client, ChunkFetcher, Directory, HttpChunkFetcher, HttpDirectory};
use crate::config::Config;
use crate::error::Result;
use crate::models::FileId;
use jobs::DownloadJobs;
use publish::Publisher;
use retrieve::{RetrieveOptions, RetrievedFile, Retriever};
use std::path::PathBuf;
use std::sync::Arc;
use storage::ChunkStore;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Everything a peer process needs: its chunk store, the publication and
/// retrieval flows, and the registry of running downloads.
#[derive(Clone)]
pub struct PeerNode {
    pub endpoint: String,
    pub store: ChunkStore,
    pub publisher: Arc<Publisher>,
    pub retriever: Arc<Retriever>,
    pub jobs: DownloadJobs,
}

impl PeerNode {
    pub async fn new(
        config: &Config,
        endpoint: String,
        directory: Arc<dyn Directory>,
        fetcher: Arc<dyn ChunkFetcher>,
    ) -> Result<Self> {
        let store = ChunkStore::open(&config.chunk_dir).await?;
        let publisher = Publisher::new(
            directory.clone(),
            store.clone(),
            endpoint.clone(),
            config.chunk_size,
            config.announce_concurrency,
        );
        let retriever = Retriever::new(
            directory,
            fetcher,
            store.clone(),
            RetrieveOptions {
                fetch_concurrency: config.fetch_concurrency,
                per_peer_concurrency: config.per_peer_concurrency,
                announce_downloads: config.announce_downloads,
                endpoint: Some(endpoint.clone()),
            },
        );
        Ok(Self {
            endpoint,
            store,
            publisher: Arc::new(publisher),
            retriever: Arc::new(retriever),
            jobs: DownloadJobs::new(),
        })
    }

    /// Peer that talks to the tracker and to other peers over HTTP.
    pub async fn connect(config: &Config, endpoint: String) -> Result<Self> {
        let client = http_client(config.request_timeout)?;
        let directory = Arc::new(HttpDirectory::new(client.clone(), &config.tracker_url));
        let fetcher = Arc::new(HttpChunkFetcher::new(client));
        Self::new(config, endpoint, directory, fetcher).await
    }

    pub async fn start_download(&self, file_id: FileId, output: PathBuf) -> (Uuid, JoinHandle<Result<RetrievedFile>>) {
        self.jobs.spawn(self.retriever.clone(), file_id, output).await
    }
}
