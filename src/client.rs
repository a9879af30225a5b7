//! Seams to the tracker and to remote chunk stores, with HTTP
//! implementations used between processes.

use crate::directory::DirectoryService;
use crate::error::{Result, SwarmError};
use crate::models::{FileId, FilePeers};
use crate::network::{ErrorResponse, RegisterRequest, RegisterResponse, UpdateChunkRequest};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn register_file(&self, filename: &str, total_chunks: i64) -> Result<FileId>;

    async fn announce_chunk(&self, file_id: FileId, chunk_index: u32, peer_address: &str) -> Result<()>;

    async fn get_peers_for_file(&self, file_id: FileId) -> Result<FilePeers>;
}

#[async_trait]
impl Directory for DirectoryService {
    async fn register_file(&self, filename: &str, total_chunks: i64) -> Result<FileId> {
        DirectoryService::register_file(self, filename, total_chunks).await
    }

    async fn announce_chunk(&self, file_id: FileId, chunk_index: u32, peer_address: &str) -> Result<()> {
        DirectoryService::announce_chunk(self, file_id, i64::from(chunk_index), peer_address).await
    }

    async fn get_peers_for_file(&self, file_id: FileId) -> Result<FilePeers> {
        DirectoryService::get_peers_for_file(self, file_id).await
    }
}

/// Fetches a single chunk from the peer at `peer_address`.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    async fn fetch_chunk(&self, peer_address: &str, file_id: FileId, chunk_index: u32) -> Result<Bytes>;
}

pub fn http_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

#[derive(Clone)]
pub struct HttpDirectory {
    client: Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn register_file(&self, filename: &str, total_chunks: i64) -> Result<FileId> {
        let resp = self
            .client
            .post(format!("{}/register", self.base_url))
            .json(&RegisterRequest {
                filename: filename.to_string(),
                total_chunks,
            })
            .send()
            .await?;
        let body: RegisterResponse = check_status(resp).await?.json().await?;
        Ok(body.file_id)
    }

    async fn announce_chunk(&self, file_id: FileId, chunk_index: u32, peer_address: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/update_chunk", self.base_url))
            .json(&UpdateChunkRequest {
                file_id,
                chunk_number: i64::from(chunk_index),
                peer_address: peer_address.to_string(),
            })
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn get_peers_for_file(&self, file_id: FileId) -> Result<FilePeers> {
        let resp = self
            .client
            .get(format!("{}/get_peers", self.base_url))
            .query(&[("file_id", file_id)])
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }
}

#[derive(Clone)]
pub struct HttpChunkFetcher {
    client: Client,
}

impl HttpChunkFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn fetch_chunk(&self, peer_address: &str, file_id: FileId, chunk_index: u32) -> Result<Bytes> {
        let url = format!(
            "{}/chunk/{}/{}",
            peer_address.trim_end_matches('/'),
            file_id,
            chunk_index
        );
        let resp = self.client.get(&url).send().await?;
        Ok(check_status(resp).await?.bytes().await?)
    }
}

/// Maps non-success responses onto the matching error kind.
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = match resp.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(match status {
        StatusCode::NOT_FOUND => SwarmError::NotFound(message),
        StatusCode::BAD_REQUEST => SwarmError::InvalidArgument(message),
        _ => SwarmError::TransientNetwork(format!("{}: {}", status, message)),
    })
}
