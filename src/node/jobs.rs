use crate::error::{Result, SwarmError};
use crate::models::FileId;
use crate::node::retrieve::{RetrievedFile, Retriever};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Running { file_id: FileId, output_path: String },
    Completed { file_id: FileId, output_path: String, bytes: u64 },
    Failed { file_id: FileId, output_path: String, error: String },
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobStatus::Running { .. })
    }
}

/// Finished jobs stay queryable for this long by default.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(60 * 60);

struct JobRecord {
    status: JobStatus,
    finished_at: Option<Instant>,
}

/// Background downloads with an observable status per job.
#[derive(Clone)]
pub struct DownloadJobs {
    jobs: Arc<RwLock<HashMap<Uuid, JobRecord>>>,
    retention: Duration,
}

impl Default for DownloadJobs {
    fn default() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }
}

impl DownloadJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Starts retrieving `file_id` into `output`. The returned handle resolves
    /// with the same outcome recorded in the job status.
    pub async fn spawn(
        &self,
        retriever: Arc<Retriever>,
        file_id: FileId,
        output: PathBuf,
    ) -> (Uuid, JoinHandle<Result<RetrievedFile>>) {
        let job_id = Uuid::new_v4();
        let output_path = output.display().to_string();
        {
            let mut jobs = self.jobs.write().await;
            let retention = self.retention;
            jobs.retain(|_, job| job.finished_at.map_or(true, |at| at.elapsed() < retention));
            jobs.insert(
                job_id,
                JobRecord {
                    status: JobStatus::Running {
                        file_id,
                        output_path: output_path.clone(),
                    },
                    finished_at: None,
                },
            );
        }

        let jobs = self.jobs.clone();
        let handle = tokio::spawn(async move {
            let download = tokio::spawn(async move { retriever.retrieve(file_id, &output).await });
            let result = match download.await {
                Ok(result) => result,
                Err(e) => Err(SwarmError::Task(e.to_string())),
            };
            let status = match &result {
                Ok(done) => {
                    info!("Download job {} finished: {} bytes", job_id, done.bytes_written);
                    JobStatus::Completed {
                        file_id,
                        output_path,
                        bytes: done.bytes_written,
                    }
                }
                Err(e) => {
                    error!("Download job {} failed: {}", job_id, e);
                    JobStatus::Failed {
                        file_id,
                        output_path,
                        error: e.to_string(),
                    }
                }
            };
            jobs.write().await.insert(
                job_id,
                JobRecord {
                    status,
                    finished_at: Some(Instant::now()),
                },
            );
            result
        });
        (job_id, handle)
    }

    pub async fn status(&self, job_id: &Uuid) -> Option<JobStatus> {
        self.jobs.read().await.get(job_id).map(|job| job.status.clone())
    }
}
