use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub type FileId = i64;

/// A file registered with the tracker.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct File {
    pub id: FileId,
    pub filename: String,
    pub total_chunks: i64,
    pub created_at: DateTime<Utc>,
}

/// One peer's claim to hold one chunk of a file.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChunkLocation {
    pub file_id: FileId,
    pub chunk_number: i64,
    pub peer_address: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_address: String,
    pub last_seen: DateTime<Utc>,
}

/// Holder sets for every chunk of a file.
///
/// Every index in `0..total_chunks` is present; an empty vector means no
/// peer has announced that chunk yet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FilePeers {
    pub file_id: FileId,
    pub filename: String,
    pub total_chunks: u32,
    pub chunks: BTreeMap<u32, Vec<PeerRecord>>,
}

impl FilePeers {
    /// Indices in `0..total_chunks` with no entry in `chunks` at all.
    pub fn missing_indices(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    pub fn holders(&self, chunk_index: u32) -> Vec<String> {
        self.chunks
            .get(&chunk_index)
            .map(|peers| peers.iter().map(|p| p.peer_address.clone()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub data: Bytes,
}

impl Chunk {
    pub fn new(index: u32, data: impl Into<Bytes>) -> Self {
        Self { index, data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Hex SHA-256 of the payload. Informational only, nothing verifies it.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        format!("{:x}", hasher.finalize())
    }
}
