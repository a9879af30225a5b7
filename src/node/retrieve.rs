use crate::client::{ChunkFetcher, Directory};
use crate::error::{Result, SwarmError};
use crate::models::{FileId, FilePeers};
use crate::node::storage::ChunkStore;
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedFile {
    pub file_id: FileId,
    pub filename: String,
    pub total_chunks: u32,
    pub bytes_written: u64,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Chunks fetched at the same time.
    pub fetch_concurrency: usize,
    /// In-flight requests allowed against a single peer endpoint.
    pub per_peer_concurrency: usize,
    /// Announce downloaded chunks under `endpoint` so others can fetch them here.
    pub announce_downloads: bool,
    pub endpoint: Option<String>,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            fetch_concurrency: 4,
            per_peer_concurrency: 2,
            announce_downloads: false,
            endpoint: None,
        }
    }
}

/// Rebuilds files from chunks held by other peers.
pub struct Retriever {
    directory: Arc<dyn Directory>,
    fetcher: Arc<dyn ChunkFetcher>,
    store: ChunkStore,
    options: RetrieveOptions,
    peer_limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Retriever {
    pub fn new(
        directory: Arc<dyn Directory>,
        fetcher: Arc<dyn ChunkFetcher>,
        store: ChunkStore,
        options: RetrieveOptions,
    ) -> Self {
        Self {
            directory,
            fetcher,
            store,
            options,
            peer_limits: Mutex::new(HashMap::new()),
        }
    }

    /// Downloads every chunk of `file_id` and writes the file to `output`.
    ///
    /// Chunks are assembled in `<output>.part`, which only replaces `output`
    /// once every chunk has been written; on failure it is removed.
    pub async fn retrieve(&self, file_id: FileId, output: &Path) -> Result<RetrievedFile> {
        info!("Starting download of file {} to {}", file_id, output.display());
        let peers = self.directory.get_peers_for_file(file_id).await?;

        let missing = peers.missing_indices();
        if !missing.is_empty() {
            error!("Tracker response for file {} lacks chunks {:?}", file_id, missing);
            return Err(SwarmError::IncompleteDirectory(missing));
        }

        let part = part_path(output);
        let assembled = self.assemble(&peers, &part).await;
        self.release_idle_limits();
        let bytes_written = match assembled {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&part).await {
                    debug!("No partial output to remove at {}: {}", part.display(), cleanup);
                }
                error!("Download of file {} failed: {}", file_id, e);
                return Err(e);
            }
        };
        fs::rename(&part, output).await?;

        metrics::counter!("files_retrieved_total").increment(1);
        info!("File download complete: {} ({} bytes)", output.display(), bytes_written);
        Ok(RetrievedFile {
            file_id,
            filename: peers.filename,
            total_chunks: peers.total_chunks,
            bytes_written,
            output_path: output.to_path_buf(),
        })
    }

    async fn assemble(&self, peers: &FilePeers, part: &Path) -> Result<u64> {
        let mut out = fs::File::create(part).await?;

        // fetched concurrently, yielded in index order
        let mut chunks = futures::stream::iter(0..peers.total_chunks)
            .map(|index| self.obtain_chunk(peers.file_id, index, peers.holders(index)))
            .buffered(self.options.fetch_concurrency.max(1));

        let mut written = 0u64;
        while let Some(chunk) = chunks.next().await {
            let data = chunk?;
            out.write_all(&data).await?;
            written += data.len() as u64;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(written)
    }

    async fn obtain_chunk(&self, file_id: FileId, index: u32, candidates: Vec<String>) -> Result<Bytes> {
        if self.store.has_chunk(file_id, index).await {
            match self.store.get_chunk(file_id, index).await {
                Ok(data) => {
                    debug!("Chunk {} of file {} already stored locally", index, file_id);
                    return Ok(data);
                }
                Err(e) => warn!("Local copy of chunk {} of file {} unreadable: {}", index, file_id, e),
            }
        }

        debug!("Processing chunk {}, available peers: {}", index, candidates.len());
        for peer in &candidates {
            if self.options.endpoint.as_deref() == Some(peer.as_str()) {
                continue;
            }
            match self.fetch_from(peer, file_id, index).await {
                Ok(data) => {
                    self.keep_copy(file_id, index, &data).await;
                    return Ok(data);
                }
                Err(e) => {
                    metrics::counter!("chunk_fetch_failures_total").increment(1);
                    warn!("Failed to download chunk {} from {}: {}", index, peer, e);
                }
            }
        }

        error!("Failed to download chunk {} of file {} from any peer", index, file_id);
        Err(SwarmError::ChunkUnavailable(index))
    }

    async fn fetch_from(&self, peer: &str, file_id: FileId, index: u32) -> Result<Bytes> {
        let _permit = self
            .peer_limit(peer)
            .acquire_owned()
            .await
            .map_err(|e| SwarmError::TransientNetwork(e.to_string()))?;

        let data = self.fetcher.fetch_chunk(peer, file_id, index).await?;
        if data.is_empty() {
            return Err(SwarmError::TransientNetwork(format!("{} returned an empty chunk", peer)));
        }
        metrics::counter!("chunks_fetched_total").increment(1);
        debug!("Downloaded chunk {} from {}, size: {} bytes", index, peer, data.len());
        Ok(data)
    }

    fn peer_limit(&self, peer: &str) -> Arc<Semaphore> {
        let mut limits = self.peer_limits.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        limits
            .entry(peer.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.options.per_peer_concurrency.max(1))))
            .clone()
    }

    /// Forgets per-peer limits that no in-flight fetch holds.
    fn release_idle_limits(&self) {
        let mut limits = self.peer_limits.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        limits.retain(|_, limit| Arc::strong_count(limit) > 1);
    }

    /// Keeps the downloaded chunk so this peer can serve it too. Failures
    /// here do not fail the download.
    async fn keep_copy(&self, file_id: FileId, index: u32, data: &[u8]) {
        if let Err(e) = self.store.put_chunk(file_id, index, data).await {
            warn!("Could not store downloaded chunk {} of file {}: {}", index, file_id, e);
            return;
        }
        if !self.options.announce_downloads {
            return;
        }
        if let Some(endpoint) = self.options.endpoint.as_deref() {
            if let Err(e) = self.directory.announce_chunk(file_id, index, endpoint).await {
                warn!("Failed to announce downloaded chunk {} of file {}: {}", index, file_id, e);
            }
        }
    }
}

fn part_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PeerRecord;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StaticDirectory {
        peers: FilePeers,
        announced: Mutex<Vec<(u32, String)>>,
    }

    impl StaticDirectory {
        fn new(total_chunks: u32, holders: &[(u32, &[&str])]) -> Self {
            let mut chunks = BTreeMap::new();
            for (index, peers) in holders {
                let records = peers
                    .iter()
                    .map(|p| PeerRecord {
                        peer_address: p.to_string(),
                        last_seen: Utc::now(),
                    })
                    .collect();
                chunks.insert(*index, records);
            }
            Self {
                peers: FilePeers {
                    file_id: 3,
                    filename: "movie.bin".into(),
                    total_chunks,
                    chunks,
                },
                announced: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Directory for StaticDirectory {
        async fn register_file(&self, _filename: &str, _total_chunks: i64) -> Result<FileId> {
            Ok(self.peers.file_id)
        }

        async fn announce_chunk(&self, _file_id: FileId, chunk_index: u32, peer_address: &str) -> Result<()> {
            self.announced.lock().unwrap().push((chunk_index, peer_address.to_string()));
            Ok(())
        }

        async fn get_peers_for_file(&self, file_id: FileId) -> Result<FilePeers> {
            if file_id != self.peers.file_id {
                return Err(SwarmError::not_found(format!("file ID {} not found", file_id)));
            }
            Ok(self.peers.clone())
        }
    }

    /// Serves `chunks` from every peer except the unreachable ones.
    struct FakeSwarm {
        chunks: Vec<Vec<u8>>,
        unreachable: HashSet<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChunkFetcher for FakeSwarm {
        async fn fetch_chunk(&self, peer_address: &str, _file_id: FileId, chunk_index: u32) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unreachable.contains(peer_address) {
                return Err(SwarmError::TransientNetwork(format!("connect to {} timed out", peer_address)));
            }
            self.chunks
                .get(chunk_index as usize)
                .map(|c| Bytes::from(c.clone()))
                .ok_or_else(|| SwarmError::not_found("chunk"))
        }
    }

    fn swarm(unreachable: &[&str]) -> FakeSwarm {
        FakeSwarm {
            chunks: vec![b"aaaa".to_vec(), b"bbbb".to_vec(), b"cc".to_vec()],
            unreachable: unreachable.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    async fn retriever(
        directory: Arc<StaticDirectory>,
        fetcher: Arc<FakeSwarm>,
        dir: &Path,
        options: RetrieveOptions,
    ) -> (Retriever, ChunkStore) {
        let store = ChunkStore::open(dir.join("chunks")).await.unwrap();
        (Retriever::new(directory, fetcher, store.clone(), options), store)
    }

    #[tokio::test]
    async fn reassembles_file_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Arc::new(StaticDirectory::new(3, &[(0, &["A"]), (1, &["A"]), (2, &["A"])]));
        let (retriever, store) =
            retriever(directory, Arc::new(swarm(&[])), tmp.path(), RetrieveOptions::default()).await;

        let output = tmp.path().join("out.bin");
        let result = retriever.retrieve(3, &output).await.unwrap();

        assert_eq!(result.bytes_written, 10);
        assert_eq!(fs::read(&output).await.unwrap(), b"aaaabbbbcc");
        assert!(!part_path(&output).exists());
        // downloaded chunks are kept locally
        assert_eq!(store.get_chunk(3, 1).await.unwrap().as_ref(), b"bbbb");
    }

    #[tokio::test]
    async fn falls_back_to_next_holder() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Arc::new(StaticDirectory::new(3, &[(0, &["A", "B"]), (1, &["B"]), (2, &["A", "B"])]));
        let fetcher = Arc::new(swarm(&["A"]));
        let (retriever, _) = retriever(directory, fetcher.clone(), tmp.path(), RetrieveOptions::default()).await;

        let output = tmp.path().join("out.bin");
        retriever.retrieve(3, &output).await.unwrap();
        assert_eq!(fs::read(&output).await.unwrap(), b"aaaabbbbcc");
        // A tried and failed for chunks 0 and 2
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn unreachable_only_holder_fails_without_output() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Arc::new(StaticDirectory::new(3, &[(0, &["B"]), (1, &["A"]), (2, &["B"])]));
        let (retriever, _) =
            retriever(directory, Arc::new(swarm(&["A"])), tmp.path(), RetrieveOptions::default()).await;

        let output = tmp.path().join("out.bin");
        let err = retriever.retrieve(3, &output).await.unwrap_err();
        assert!(matches!(err, SwarmError::ChunkUnavailable(1)));
        assert!(!output.exists());
        assert!(!part_path(&output).exists());
    }

    #[tokio::test]
    async fn chunk_without_holders_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Arc::new(StaticDirectory::new(3, &[(0, &["A"]), (1, &[]), (2, &["A"])]));
        let (retriever, _) =
            retriever(directory, Arc::new(swarm(&[])), tmp.path(), RetrieveOptions::default()).await;

        let err = retriever.retrieve(3, &tmp.path().join("out.bin")).await.unwrap_err();
        assert!(matches!(err, SwarmError::ChunkUnavailable(1)));
    }

    #[tokio::test]
    async fn missing_index_is_incomplete_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Arc::new(StaticDirectory::new(3, &[(0, &["A"]), (2, &["A"])]));
        let fetcher = Arc::new(swarm(&[]));
        let (retriever, _) = retriever(directory, fetcher.clone(), tmp.path(), RetrieveOptions::default()).await;

        let err = retriever.retrieve(3, &tmp.path().join("out.bin")).await.unwrap_err();
        match err {
            SwarmError::IncompleteDirectory(missing) => assert_eq!(missing, vec![1]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Arc::new(StaticDirectory::new(1, &[(0, &["A"])]));
        let (retriever, _) =
            retriever(directory, Arc::new(swarm(&[])), tmp.path(), RetrieveOptions::default()).await;

        let err = retriever.retrieve(99, &tmp.path().join("out.bin")).await.unwrap_err();
        assert!(matches!(err, SwarmError::NotFound(_)));
    }

    #[tokio::test]
    async fn rerun_uses_locally_stored_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Arc::new(StaticDirectory::new(3, &[(0, &["A"]), (1, &["A"]), (2, &["A"])]));
        let fetcher = Arc::new(swarm(&[]));
        let (retriever, _) = retriever(directory, fetcher.clone(), tmp.path(), RetrieveOptions::default()).await;

        retriever.retrieve(3, &tmp.path().join("first.bin")).await.unwrap();
        retriever.retrieve(3, &tmp.path().join("second.bin")).await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read(tmp.path().join("second.bin")).await.unwrap(), b"aaaabbbbcc");
    }

    #[tokio::test]
    async fn downloaded_chunks_are_announced_when_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Arc::new(StaticDirectory::new(3, &[(0, &["A"]), (1, &["A"]), (2, &["A"])]));
        let options = RetrieveOptions {
            announce_downloads: true,
            endpoint: Some("http://me".into()),
            ..RetrieveOptions::default()
        };
        let (retriever, _) = retriever(directory.clone(), Arc::new(swarm(&[])), tmp.path(), options).await;

        retriever.retrieve(3, &tmp.path().join("out.bin")).await.unwrap();
        let mut announced = directory.announced.lock().unwrap().clone();
        announced.sort();
        assert_eq!(
            announced,
            vec![(0, "http://me".to_string()), (1, "http://me".to_string()), (2, "http://me".to_string())]
        );
    }

    /// Chunk 1 fails only once chunk 2, a large payload, has been handed
    /// back, so chunk 2 is still being stored when the download aborts.
    struct LateFailure {
        large: Vec<u8>,
        large_served: tokio::sync::Notify,
    }

    #[async_trait]
    impl ChunkFetcher for LateFailure {
        async fn fetch_chunk(&self, _peer_address: &str, _file_id: FileId, chunk_index: u32) -> Result<Bytes> {
            match chunk_index {
                1 => {
                    self.large_served.notified().await;
                    Err(SwarmError::TransientNetwork("connection reset".into()))
                }
                2 => {
                    self.large_served.notify_one();
                    Ok(Bytes::from(self.large.clone()))
                }
                _ => Ok(Bytes::from_static(b"aaaa")),
            }
        }
    }

    async fn temp_entries(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return names;
        };
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".tmp") {
                names.push(name);
            }
        }
        names
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_download_leaves_no_temp_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let directory = Arc::new(StaticDirectory::new(3, &[(0, &["A"]), (1, &["A"]), (2, &["A"])]));
        let fetcher = Arc::new(LateFailure {
            large: vec![7u8; 32 * 1024 * 1024],
            large_served: tokio::sync::Notify::new(),
        });
        let store = ChunkStore::open(tmp.path().join("chunks")).await.unwrap();
        let options = RetrieveOptions {
            per_peer_concurrency: 4,
            ..RetrieveOptions::default()
        };
        let retriever = Retriever::new(directory, fetcher, store.clone(), options);

        let err = retriever.retrieve(3, &tmp.path().join("out.bin")).await.unwrap_err();
        assert!(matches!(err, SwarmError::ChunkUnavailable(1)));

        // the interrupted store still finishes with a rename
        let file_dir = tmp.path().join("chunks").join("3");
        for _ in 0..100 {
            if store.has_chunk(3, 2).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(store.has_chunk(3, 2).await);
        assert!(temp_entries(&file_dir).await.is_empty());
    }

    /// Records the peak number of concurrent requests per endpoint.
    #[derive(Default)]
    struct PeakTracker {
        in_flight: Mutex<HashMap<String, usize>>,
        peak: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl ChunkFetcher for PeakTracker {
        async fn fetch_chunk(&self, peer_address: &str, _file_id: FileId, chunk_index: u32) -> Result<Bytes> {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let current = in_flight.entry(peer_address.to_string()).or_insert(0);
                *current += 1;
                let mut peak = self.peak.lock().unwrap();
                let highest = peak.entry(peer_address.to_string()).or_insert(0);
                *highest = (*highest).max(*current);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            *self.in_flight.lock().unwrap().get_mut(peer_address).unwrap() -= 1;
            Ok(Bytes::from(vec![chunk_index as u8; 4]))
        }
    }

    #[tokio::test]
    async fn requests_per_peer_stay_within_limit() {
        let tmp = tempfile::tempdir().unwrap();
        const BOTH: &[&str] = &["A", "B"];
        let holders: Vec<(u32, &[&str])> = (0..12).map(|i| (i, &BOTH[..1 + (i as usize % 2)])).collect();
        let directory = Arc::new(StaticDirectory::new(12, &holders));
        let fetcher = Arc::new(PeakTracker::default());
        let store = ChunkStore::open(tmp.path().join("chunks")).await.unwrap();
        let options = RetrieveOptions {
            fetch_concurrency: 8,
            per_peer_concurrency: 2,
            ..RetrieveOptions::default()
        };
        let retriever = Retriever::new(directory, fetcher.clone(), store, options);

        let result = retriever.retrieve(3, &tmp.path().join("out.bin")).await.unwrap();
        assert_eq!(result.bytes_written, 48);

        let peak = fetcher.peak.lock().unwrap().clone();
        assert!(peak["A"] <= 2, "peer A saw {} concurrent requests", peak["A"]);
        assert!(retriever.peer_limits.lock().unwrap().is_empty());
    }
}
