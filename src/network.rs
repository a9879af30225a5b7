//! JSON bodies exchanged over the tracker and peer HTTP surfaces.

use crate::models::FileId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub filename: String,
    pub total_chunks: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub file_id: FileId,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateChunkRequest {
    pub file_id: FileId,
    pub chunk_number: i64,
    pub peer_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetPeersQuery {
    pub file_id: FileId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShareResponse {
    pub success: bool,
    pub file_id: FileId,
    pub filename: String,
    pub total_chunks: u32,
    pub announce_failures: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub file_id: FileId,
    pub output_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadStartedResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub message: String,
}
