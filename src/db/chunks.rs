use crate::models::{ChunkLocation, FileId};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};

/// Inserts the location record, or refreshes `last_seen` when the peer has
/// already announced this chunk.
pub async fn upsert_chunk_location(
    pool: &Pool<Sqlite>,
    file_id: FileId,
    chunk_number: i64,
    peer_address: &str,
    seen_at: DateTime<Utc>,
) -> Result<ChunkLocation, sqlx::Error> {
    sqlx::query_as::<_, ChunkLocation>(
        r#"
        INSERT INTO chunks (file_id, chunk_number, peer_address, last_seen)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (file_id, chunk_number, peer_address)
        DO UPDATE SET last_seen = excluded.last_seen
        RETURNING file_id, chunk_number, peer_address, last_seen
        "#,
    )
    .bind(file_id)
    .bind(chunk_number)
    .bind(peer_address)
    .bind(seen_at)
    .fetch_one(pool)
    .await
}

pub async fn get_locations_for_file(
    pool: &Pool<Sqlite>,
    file_id: FileId,
) -> Result<Vec<ChunkLocation>, sqlx::Error> {
    sqlx::query_as::<_, ChunkLocation>(
        r#"
        SELECT file_id, chunk_number, peer_address, last_seen
        FROM chunks
        WHERE file_id = ?
        ORDER BY chunk_number, peer_address
        "#,
    )
    .bind(file_id)
    .fetch_all(pool)
    .await
}
