//! Tracker-side directory of files and chunk holders.

use crate::db;
use crate::error::{Result, SwarmError};
use crate::models::{File, FileId, FilePeers, PeerRecord};
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info};
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Clone)]
pub struct DirectoryService {
    pool: Pool<Sqlite>,
    peer_ttl: Option<Duration>,
}

impl DirectoryService {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool, peer_ttl: None }
    }

    /// Hide location records not refreshed within `ttl` from peer queries.
    /// Records stay in the database.
    pub fn with_peer_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.peer_ttl = ttl;
        self
    }

    pub async fn register_file(&self, filename: &str, total_chunks: i64) -> Result<FileId> {
        if filename.trim().is_empty() {
            return Err(SwarmError::invalid("filename must not be empty"));
        }
        if total_chunks <= 0 {
            return Err(SwarmError::invalid(format!(
                "total_chunks must be positive, got {}",
                total_chunks
            )));
        }

        let file = db::files::create_file(&self.pool, filename, total_chunks, Utc::now()).await?;
        metrics::counter!("files_registered_total").increment(1);
        info!("Registered file {} as id {} ({} chunks)", filename, file.id, total_chunks);
        Ok(file.id)
    }

    pub async fn announce_chunk(&self, file_id: FileId, chunk_index: i64, peer_address: &str) -> Result<()> {
        if peer_address.trim().is_empty() {
            return Err(SwarmError::invalid("peer_address must not be empty"));
        }
        let file = self.require_file(file_id).await?;
        if chunk_index < 0 || chunk_index >= file.total_chunks {
            return Err(SwarmError::invalid(format!(
                "chunk {} out of range for file {} with {} chunks",
                chunk_index, file_id, file.total_chunks
            )));
        }

        let record =
            db::chunks::upsert_chunk_location(&self.pool, file_id, chunk_index, peer_address, Utc::now())
                .await?;
        metrics::counter!("chunks_announced_total").increment(1);
        debug!(
            "Peer {} holds chunk {} of file {} (last seen {})",
            record.peer_address, record.chunk_number, record.file_id, record.last_seen
        );
        Ok(())
    }

    pub async fn get_peers_for_file(&self, file_id: FileId) -> Result<FilePeers> {
        let file = self.require_file(file_id).await?;
        let total_chunks = u32::try_from(file.total_chunks)
            .map_err(|_| SwarmError::invalid(format!("file {} has an invalid chunk count", file_id)))?;

        let cutoff = self
            .peer_ttl
            .and_then(|ttl| ChronoDuration::from_std(ttl).ok())
            .map(|ttl| Utc::now() - ttl);

        let mut chunks: BTreeMap<u32, Vec<PeerRecord>> = (0..total_chunks).map(|i| (i, Vec::new())).collect();
        for location in db::chunks::get_locations_for_file(&self.pool, file_id).await? {
            if cutoff.is_some_and(|c| location.last_seen < c) {
                continue;
            }
            let Ok(index) = u32::try_from(location.chunk_number) else {
                continue;
            };
            if let Some(holders) = chunks.get_mut(&index) {
                holders.push(PeerRecord {
                    peer_address: location.peer_address,
                    last_seen: location.last_seen,
                });
            }
        }

        // freshest holder first, ties broken by address
        for holders in chunks.values_mut() {
            holders.sort_by(|a, b| {
                b.last_seen
                    .cmp(&a.last_seen)
                    .then_with(|| a.peer_address.cmp(&b.peer_address))
            });
        }

        Ok(FilePeers {
            file_id,
            filename: file.filename,
            total_chunks,
            chunks,
        })
    }

    pub async fn list_files(&self) -> Result<Vec<File>> {
        Ok(db::files::list_all_files(&self.pool).await?)
    }

    pub async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }

    async fn require_file(&self, file_id: FileId) -> Result<File> {
        db::files::get_file_by_id(&self.pool, file_id)
            .await?
            .ok_or_else(|| SwarmError::not_found(format!("file ID {} not found", file_id)))
    }
}
