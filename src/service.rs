//! Job status operations behind the HTTP API and the CLI.
//!
//! Job creation inserts the `Queued` row and then publishes the processing
//! message. If the publish fails the row is deleted again, so no job is left
//! queued without a message.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::models::{Job, JobQuery, JobStats, JobStatus, ProcessingMessage};
use crate::queue::MessagePublisher;
use crate::store::JobStore;

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub file_name: String,
    pub csv_content: String,
    /// Defaults to the byte length of `csv_content`.
    #[serde(default)]
    pub file_size_bytes: Option<u64>,
    #[serde(default)]
    pub uploaded_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: String,
    pub message: String,
    pub status: JobStatus,
    pub created_at_utc: DateTime<Utc>,
}

/// A job plus fields derived for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    /// `completedAt - createdAt` as `HH:MM:SS`; null until finished.
    pub duration: Option<String>,
    pub is_completed: bool,
    pub status_text: String,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let duration = job
            .completed_at_utc
            .map(|done| format_duration(done - job.created_at_utc));
        let status_text = status_text(job.status, job.progress_percentage);
        Self {
            is_completed: job.status.is_terminal(),
            duration,
            status_text,
            job,
        }
    }
}

pub fn status_text(status: JobStatus, progress: u8) -> String {
    match status {
        JobStatus::Queued => "Queued for processing".to_string(),
        JobStatus::Processing => format!("Processing... ({}%)", progress),
        JobStatus::Completed => "Completed successfully".to_string(),
        JobStatus::Failed => "Failed".to_string(),
        JobStatus::Cancelled => "Cancelled".to_string(),
    }
}

fn format_duration(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub total_count: u64,
    pub page: u32,
    pub page_size: u32,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

/// What `delete_job` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Cancelled,
    Deleted,
}

impl DeleteOutcome {
    pub fn message(self) -> &'static str {
        match self {
            DeleteOutcome::Cancelled => "Job cancelled successfully",
            DeleteOutcome::Deleted => "Job deleted successfully",
        }
    }
}

#[derive(Clone)]
pub struct JobService {
    jobs: Arc<dyn JobStore>,
    publisher: Arc<dyn MessagePublisher>,
}

impl JobService {
    pub fn new(jobs: Arc<dyn JobStore>, publisher: Arc<dyn MessagePublisher>) -> Self {
        Self { jobs, publisher }
    }

    pub fn publisher(&self) -> &Arc<dyn MessagePublisher> {
        &self.publisher
    }

    pub async fn create_job(&self, request: CreateJobRequest) -> Result<CreateJobResponse, IngestError> {
        let file_name = request.file_name.trim();
        if file_name.is_empty() {
            return Err(IngestError::InvalidRequest("fileName must not be empty".to_string()));
        }
        if request.csv_content.trim().is_empty() {
            return Err(IngestError::InvalidRequest("csvContent must not be empty".to_string()));
        }

        let size = request
            .file_size_bytes
            .unwrap_or(request.csv_content.len() as u64);
        let job = Job::new_queued(file_name, size, request.uploaded_by);
        self.jobs.insert_job(&job).await?;

        let message = ProcessingMessage::for_job(&job, request.csv_content);
        if let Err(err) = self.publisher.publish(&message).await {
            tracing::error!(job_id = %job.id, error = %err, "enqueue failed, removing job");
            if let Err(cleanup) = self.jobs.delete_job(&job.id).await {
                tracing::error!(job_id = %job.id, error = %cleanup, "could not remove unqueued job");
            }
            return Err(IngestError::Queue(
                "Failed to queue job for processing".to_string(),
            ));
        }

        tracing::info!(job_id = %job.id, file_name = %job.file_name, bytes = size, "job queued");
        Ok(CreateJobResponse {
            job_id: job.id,
            message: "CSV upload job has been queued for processing".to_string(),
            status: job.status,
            created_at_utc: job.created_at_utc,
        })
    }

    pub async fn get_job(&self, id: &str) -> Result<JobView, IngestError> {
        self.jobs
            .get_job(id)
            .await?
            .map(JobView::from)
            .ok_or_else(|| IngestError::NotFound("Job not found".to_string()))
    }

    pub async fn list_jobs(&self, query: JobQuery) -> Result<JobListResponse, IngestError> {
        if query.page < 1 {
            return Err(IngestError::InvalidRequest("page must be >= 1".to_string()));
        }
        if query.page_size < 1 || query.page_size > MAX_PAGE_SIZE {
            return Err(IngestError::InvalidRequest(format!(
                "pageSize must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }

        let (jobs, total_count) = self.jobs.list_jobs(&query).await?;
        Ok(JobListResponse {
            jobs: jobs.into_iter().map(JobView::from).collect(),
            total_count,
            page: query.page,
            page_size: query.page_size,
            has_next_page: (query.page as u64) * (query.page_size as u64) < total_count,
            has_previous_page: query.page > 1,
        })
    }

    /// Cancels a queued job, deletes a finished one, refuses a running one.
    pub async fn delete_job(&self, id: &str) -> Result<DeleteOutcome, IngestError> {
        let job = self
            .jobs
            .get_job(id)
            .await?
            .ok_or_else(|| IngestError::NotFound("Job not found".to_string()))?;

        match job.status {
            JobStatus::Processing => Err(processing_conflict()),
            JobStatus::Queued => {
                if self.jobs.cancel_job(id, Utc::now()).await? {
                    tracing::info!(job_id = id, "job cancelled");
                    Ok(DeleteOutcome::Cancelled)
                } else {
                    // The worker picked it up in the meantime.
                    Err(processing_conflict())
                }
            }
            _ => {
                self.jobs.delete_job(id).await?;
                tracing::info!(job_id = id, "job deleted");
                Ok(DeleteOutcome::Deleted)
            }
        }
    }

    pub async fn stats(&self) -> Result<JobStats, IngestError> {
        Ok(self.jobs.job_stats().await?)
    }
}

fn processing_conflict() -> IngestError {
    IngestError::Conflict("Cannot delete job that is currently processing".to_string())
}
