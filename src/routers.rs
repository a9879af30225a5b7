//! HTTP surfaces: the tracker's directory API and a peer's chunk and
//! publisher-facing API.

use crate::directory::DirectoryService;
use crate::error::SwarmError;
use crate::models::FileId;
use crate::network::{
    DownloadRequest, DownloadStartedResponse, ErrorResponse, GetPeersQuery, HealthResponse, MessageResponse,
    RegisterRequest, RegisterResponse, ShareResponse, UpdateChunkRequest,
};
use crate::node::PeerNode;
use crate::node::publish::PublishedFile;
use futures::TryStreamExt;
use log::{debug, error, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::reply::Response;
use warp::{Filter, Reply};

const JSON_BODY_LIMIT: u64 = 64 * 1024;
const UPLOAD_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

pub fn tracker_routes(
    directory: DirectoryService,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let directory_filter = warp::any().map(move || directory.clone());

    let register = warp::path("register")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(JSON_BODY_LIMIT))
        .and(warp::body::json())
        .and(directory_filter.clone())
        .and_then(|body: RegisterRequest, directory: DirectoryService| async move {
            register_file(directory, body).await
        });

    let update_chunk = warp::path("update_chunk")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(JSON_BODY_LIMIT))
        .and(warp::body::json())
        .and(directory_filter.clone())
        .and_then(|body: UpdateChunkRequest, directory: DirectoryService| async move {
            update_chunk(directory, body).await
        });

    let get_peers = warp::path("get_peers")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<GetPeersQuery>())
        .and(directory_filter.clone())
        .and_then(|query: GetPeersQuery, directory: DirectoryService| async move {
            get_peers(directory, query.file_id).await
        });

    let files = warp::path("files")
        .and(warp::path::end())
        .and(warp::get())
        .and(directory_filter.clone())
        .and_then(|directory: DirectoryService| async move { list_files(directory).await });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(directory_filter)
        .and_then(|directory: DirectoryService| async move { tracker_health(directory).await });

    register.or(update_chunk).or(get_peers).or(files).or(health)
}

pub fn peer_routes(node: PeerNode) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let node_filter = warp::any().map(move || node.clone());

    let chunk = warp::path!("chunk" / FileId / u32)
        .and(warp::get())
        .and(node_filter.clone())
        .and_then(|file_id: FileId, chunk_index: u32, node: PeerNode| async move {
            serve_chunk(node, file_id, chunk_index).await
        });

    let share = warp::path!("api" / "share")
        .and(warp::post())
        .and(warp::multipart::form().max_length(UPLOAD_LIMIT))
        .and(node_filter.clone())
        .and_then(|form: FormData, node: PeerNode| async move { share_upload(node, form).await });

    let download = warp::path!("api" / "download")
        .and(warp::post())
        .and(warp::body::content_length_limit(JSON_BODY_LIMIT))
        .and(warp::body::json())
        .and(node_filter.clone())
        .and_then(|body: DownloadRequest, node: PeerNode| async move { start_download(node, body).await });

    let download_status = warp::path!("api" / "download" / Uuid)
        .and(warp::get())
        .and(node_filter)
        .and_then(|job_id: Uuid, node: PeerNode| async move { download_status(node, job_id).await });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| json_reply(&HealthResponse { status: "healthy".into() }, StatusCode::OK));

    chunk.or(share).or(download).or(download_status).or(health)
}

fn json_reply<T: Serialize>(body: &T, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn error_reply(e: &SwarmError) -> Response {
    let status = match e {
        SwarmError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        SwarmError::NotFound(_) => StatusCode::NOT_FOUND,
        SwarmError::ChunkUnavailable(_) | SwarmError::IncompleteDirectory(_) => StatusCode::SERVICE_UNAVAILABLE,
        SwarmError::TransientNetwork(_) => StatusCode::BAD_GATEWAY,
        SwarmError::Storage(_) | SwarmError::Database(_) | SwarmError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    } else {
        warn!("Request rejected: {}", e);
    }
    json_reply(&ErrorResponse { error: e.to_string() }, status)
}

async fn register_file(directory: DirectoryService, body: RegisterRequest) -> Result<Response, warp::Rejection> {
    Ok(match directory.register_file(&body.filename, body.total_chunks).await {
        Ok(file_id) => json_reply(
            &RegisterResponse {
                file_id,
                message: "File registered successfully".into(),
            },
            StatusCode::OK,
        ),
        Err(e) => error_reply(&e),
    })
}

async fn update_chunk(directory: DirectoryService, body: UpdateChunkRequest) -> Result<Response, warp::Rejection> {
    debug!("Received update_chunk request: {:?}", body);
    Ok(
        match directory
            .announce_chunk(body.file_id, body.chunk_number, &body.peer_address)
            .await
        {
            Ok(()) => json_reply(
                &MessageResponse {
                    message: "Chunk updated successfully".into(),
                },
                StatusCode::OK,
            ),
            Err(e) => error_reply(&e),
        },
    )
}

async fn get_peers(directory: DirectoryService, file_id: FileId) -> Result<Response, warp::Rejection> {
    Ok(match directory.get_peers_for_file(file_id).await {
        Ok(peers) => json_reply(&peers, StatusCode::OK),
        Err(e) => error_reply(&e),
    })
}

async fn list_files(directory: DirectoryService) -> Result<Response, warp::Rejection> {
    Ok(match directory.list_files().await {
        Ok(files) => json_reply(&files, StatusCode::OK),
        Err(e) => error_reply(&e),
    })
}

async fn tracker_health(directory: DirectoryService) -> Result<Response, warp::Rejection> {
    Ok(match directory.health_check().await {
        Ok(_) => json_reply(&HealthResponse { status: "healthy".into() }, StatusCode::OK),
        Err(e) => error_reply(&e),
    })
}

async fn serve_chunk(node: PeerNode, file_id: FileId, chunk_index: u32) -> Result<Response, warp::Rejection> {
    debug!("Received request for chunk {} of file {}", chunk_index, file_id);
    Ok(match node.store.get_chunk(file_id, chunk_index).await {
        Ok(data) => {
            metrics::counter!("chunks_served_total").increment(1);
            debug!("Sending chunk {} of file {}, size: {} bytes", chunk_index, file_id, data.len());
            warp::reply::with_header(data.to_vec(), "content-type", "application/octet-stream").into_response()
        }
        Err(e) => error_reply(&e),
    })
}

async fn share_upload(node: PeerNode, form: FormData) -> Result<Response, warp::Rejection> {
    let staging = node.store.staging_dir();
    let shared = receive_and_share(&node, form, &staging).await;
    if let Err(e) = fs::remove_dir_all(&staging).await {
        debug!("No upload staging left at {}: {}", staging.display(), e);
    }
    Ok(match shared {
        Ok(published) => json_reply(
            &ShareResponse {
                success: true,
                file_id: published.file_id,
                filename: published.filename,
                total_chunks: published.total_chunks,
                announce_failures: published.announce_failures.len(),
            },
            StatusCode::OK,
        ),
        Err(e) => error_reply(&e),
    })
}

/// Streams the `file` part into `staging` and publishes it from there.
async fn receive_and_share(node: &PeerNode, form: FormData, staging: &Path) -> crate::Result<PublishedFile> {
    futures::pin_mut!(form);
    while let Some(part) = form.try_next().await.map_err(malformed_upload)? {
        if part.name() != "file" {
            continue;
        }
        // only the final path component of the client's name is used
        let filename = part
            .filename()
            .and_then(|name| Path::new(name).file_name())
            .map(|name| name.to_owned())
            .ok_or_else(|| SwarmError::invalid("No file selected"))?;

        fs::create_dir_all(staging).await?;
        let path = staging.join(&filename);
        let mut out = fs::File::create(&path).await?;
        let data = part.stream();
        futures::pin_mut!(data);
        while let Some(mut buf) = data.try_next().await.map_err(malformed_upload)? {
            out.write_all_buf(&mut buf).await?;
        }
        out.flush().await?;
        drop(out);

        debug!("Received upload {} into {}", path.display(), staging.display());
        return node.publisher.share_file(&path).await;
    }
    Err(SwarmError::invalid("No file provided"))
}

fn malformed_upload(e: warp::Error) -> SwarmError {
    SwarmError::invalid(format!("malformed upload: {}", e))
}

async fn start_download(node: PeerNode, body: DownloadRequest) -> Result<Response, warp::Rejection> {
    if body.output_path.trim().is_empty() {
        return Ok(error_reply(&SwarmError::invalid("Missing required parameters")));
    }
    let (job_id, _handle) = node.start_download(body.file_id, PathBuf::from(&body.output_path)).await;
    Ok(json_reply(
        &DownloadStartedResponse {
            success: true,
            job_id,
            message: "Download started".into(),
        },
        StatusCode::ACCEPTED,
    ))
}

async fn download_status(node: PeerNode, job_id: Uuid) -> Result<Response, warp::Rejection> {
    Ok(match node.jobs.status(&job_id).await {
        Some(status) => json_reply(&status, StatusCode::OK),
        None => error_reply(&SwarmError::not_found(format!("download job {}", job_id))),
    })
}
