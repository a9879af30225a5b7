use crate::error::{Result, SwarmError};
use crate::models::FileId;
use bytes::Bytes;
use log::{debug, info};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

const UPLOAD_DIR_PREFIX: &str = ".upload-";

/// Peer-local chunk payloads, one file per chunk under
/// `<base_dir>/<file_id>/chunk_<index>`.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    base_dir: PathBuf,
}

impl ChunkStore {
    /// Opens the store and removes temp files and upload staging
    /// directories left by an earlier process.
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        let removed = sweep_leftovers(&base_dir).await?;
        if removed > 0 {
            info!("Removed {} leftover temp entries from {}", removed, base_dir.display());
        }
        Ok(Self { base_dir })
    }

    /// Fresh directory for staging an uploaded file. The caller removes it.
    pub fn staging_dir(&self) -> PathBuf {
        self.base_dir.join(format!("{}{}", UPLOAD_DIR_PREFIX, Uuid::new_v4()))
    }

    fn chunk_path(&self, file_id: FileId, chunk_index: u32) -> PathBuf {
        self.base_dir
            .join(file_id.to_string())
            .join(format!("chunk_{:06}", chunk_index))
    }

    /// Stores the payload, replacing any previous copy. Readers see either
    /// the old or the new payload, never a partial one.
    pub async fn put_chunk(&self, file_id: FileId, chunk_index: u32, payload: &[u8]) -> Result<()> {
        let path = self.chunk_path(file_id, chunk_index);
        let dir = path
            .parent()
            .ok_or_else(|| SwarmError::invalid("chunk path has no parent directory"))?;
        fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!(".chunk_{:06}.{}.tmp", chunk_index, Uuid::new_v4()));
        let size = payload.len();
        let payload = Bytes::copy_from_slice(payload);

        // runs to completion even if the caller is dropped mid-write
        let written = tokio::spawn(async move {
            let result = write_then_rename(&tmp, &path, &payload).await;
            if result.is_err() {
                let _ = fs::remove_file(&tmp).await;
            }
            result
        })
        .await
        .map_err(|e| SwarmError::Task(e.to_string()))?;
        written?;
        debug!("Stored chunk {} of file {} ({} bytes)", chunk_index, file_id, size);
        Ok(())
    }

    pub async fn get_chunk(&self, file_id: FileId, chunk_index: u32) -> Result<Bytes> {
        match fs::read(self.chunk_path(file_id, chunk_index)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SwarmError::not_found(format!(
                "chunk {} of file {}",
                chunk_index, file_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn has_chunk(&self, file_id: FileId, chunk_index: u32) -> bool {
        fs::try_exists(self.chunk_path(file_id, chunk_index))
            .await
            .unwrap_or(false)
    }
}

fn is_temp_chunk(name: &str) -> bool {
    name.starts_with(".chunk_") && name.ends_with(".tmp")
}

async fn sweep_leftovers(base_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(base_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(UPLOAD_DIR_PREFIX) {
            fs::remove_dir_all(entry.path()).await?;
            removed += 1;
            continue;
        }
        let mut files = fs::read_dir(entry.path()).await?;
        while let Some(file) = files.next_entry().await? {
            if is_temp_chunk(&file.file_name().to_string_lossy()) {
                fs::remove_file(file.path()).await?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

async fn write_then_rename(tmp: &Path, dest: &Path, payload: &[u8]) -> std::io::Result<()> {
    fs::write(tmp, payload).await?;
    fs::rename(tmp, dest).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).await.unwrap();

        store.put_chunk(1, 0, b"hello").await.unwrap();
        assert_eq!(store.get_chunk(1, 0).await.unwrap(), Bytes::from_static(b"hello"));
        assert!(store.has_chunk(1, 0).await);
        assert!(!store.has_chunk(1, 1).await);
    }

    #[tokio::test]
    async fn missing_chunk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).await.unwrap();
        assert!(matches!(store.get_chunk(9, 3).await, Err(SwarmError::NotFound(_))));
    }

    #[tokio::test]
    async fn put_overwrites_existing_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).await.unwrap();

        store.put_chunk(1, 2, b"first version").await.unwrap();
        store.put_chunk(1, 2, b"second").await.unwrap();
        assert_eq!(store.get_chunk(1, 2).await.unwrap(), Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn concurrent_writes_to_same_key_never_tear() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).await.unwrap();

        let payloads: Vec<Vec<u8>> = (0u8..8).map(|b| vec![b; 64 * 1024]).collect();
        let mut handles = Vec::new();
        for payload in payloads.clone() {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.put_chunk(5, 0, &payload).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.get_chunk(5, 0).await.unwrap();
        assert!(payloads.iter().any(|p| p.as_slice() == stored.as_ref()));

        // no temporary files left behind
        let mut entries = fs::read_dir(dir.path().join("5")).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["chunk_000000".to_string()]);
    }

    #[tokio::test]
    async fn open_sweeps_leftover_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).await.unwrap();
        store.put_chunk(2, 0, b"kept").await.unwrap();

        let stale = dir.path().join("2").join(".chunk_000001.dead.tmp");
        fs::write(&stale, b"half").await.unwrap();
        let staging = store.staging_dir();
        fs::create_dir_all(&staging).await.unwrap();
        fs::write(staging.join("upload.bin"), b"partial upload").await.unwrap();

        let store = ChunkStore::open(dir.path()).await.unwrap();
        assert!(!stale.exists());
        assert!(!staging.exists());
        assert_eq!(store.get_chunk(2, 0).await.unwrap(), Bytes::from_static(b"kept"));
    }
}
