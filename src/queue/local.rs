//! In-process queue over a bounded `tokio::sync::mpsc` channel.
//!
//! Used when `[broker] kind = "local"`: the API and the worker share one
//! process and no broker is needed. Messages are JSON-encoded exactly as on
//! the AMQP path and consumed by a single task, one at a time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Disposition, MessageHandler, MessagePublisher};
use crate::error::IngestError;
use crate::models::{JobQuery, JobStatus, ProcessingMessage};
use crate::store::JobStore;

const CHANNEL_CAPACITY: usize = 1024;
const SWEEP_PAGE_SIZE: u32 = 100;

pub const ORPHANED_JOB_MESSAGE: &str =
    "Job was queued in the local in-process queue, which did not survive a restart. Upload the file again.";

/// Creates a connected publisher/consumer pair.
pub fn channel() -> (LocalPublisher, LocalConsumer) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (LocalPublisher { tx }, LocalConsumer { rx })
}

#[derive(Clone)]
pub struct LocalPublisher {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl MessagePublisher for LocalPublisher {
    async fn publish(&self, message: &ProcessingMessage) -> Result<(), IngestError> {
        let body = serde_json::to_vec(message)
            .map_err(|e| IngestError::Transport(format!("encode message: {}", e)))?;
        self.tx
            .send(body)
            .await
            .map_err(|_| IngestError::Transport("local queue consumer has stopped".to_string()))?;
        tracing::debug!(job_id = %message.job_id, "message queued locally");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub struct LocalConsumer {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl LocalConsumer {
    /// Processes messages until cancelled or every publisher is dropped.
    ///
    /// Cancellation is checked between messages only.
    pub async fn run(mut self, handler: Arc<MessageHandler>, cancel: CancellationToken) {
        tracing::info!("local queue consumer started");
        loop {
            let body = tokio::select! {
                _ = cancel.cancelled() => break,
                body = self.rx.recv() => body,
            };
            let Some(body) = body else {
                break;
            };
            if handler.handle(&body).await == Disposition::Reject {
                tracing::warn!("local message rejected");
            }
        }
        tracing::info!("local queue consumer stopped");
    }
}

/// Fails jobs left `Queued` by an earlier process.
///
/// Local messages live only in memory, so a job created before `started_at`
/// can never be delivered to this process. Jobs created later belong to the
/// current queue and are left alone.
pub async fn fail_orphaned_jobs(
    jobs: &dyn JobStore,
    started_at: DateTime<Utc>,
) -> anyhow::Result<u64> {
    let mut orphaned = Vec::new();
    let mut query = JobQuery {
        page: 1,
        page_size: SWEEP_PAGE_SIZE,
        status: Some(JobStatus::Queued),
    };
    loop {
        let (page, total) = jobs.list_jobs(&query).await?;
        orphaned.extend(
            page.into_iter()
                .filter(|job| job.created_at_utc < started_at)
                .map(|job| job.id),
        );
        if u64::from(query.page) * u64::from(query.page_size) >= total {
            break;
        }
        query.page += 1;
    }

    let mut failed = 0;
    for id in orphaned {
        let now = Utc::now();
        if jobs.start_job(&id, now).await?
            && jobs.fail_job(&id, ORPHANED_JOB_MESSAGE, now).await?
        {
            tracing::warn!(job_id = %id, "queued job lost with the previous local queue");
            failed += 1;
        }
    }
    if failed > 0 {
        tracing::info!(failed, "failed jobs orphaned by a restart");
    }
    Ok(failed)
}
