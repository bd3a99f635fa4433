//! Queue bridge between the job API and the worker.
//!
//! The publish side is the [`MessagePublisher`] trait. The consume side is
//! broker-independent: transports hand raw message bodies to
//! [`MessageHandler::handle`] one at a time and settle the delivery according
//! to the returned [`Disposition`].
//!
//! | Transport | Publisher | Consumer |
//! |-----------|-----------|----------|
//! | AMQP ([`amqp`]) | [`amqp::AmqpPublisher`] | [`amqp::AmqpConsumer`] |
//! | In-process ([`local`]) | [`local::LocalPublisher`] | [`local::LocalConsumer`] |

pub mod amqp;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::ProcessingConfig;
use crate::error::IngestError;
use crate::models::{JobStatus, ProcessingMessage};
use crate::processor::JobProcessor;
use crate::progress::JobProgress;
use crate::store::{CatalogStore, JobStore};

/// Publishes processing messages for newly created jobs.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Sends one persistent message. Fails with [`IngestError::Transport`].
    async fn publish(&self, message: &ProcessingMessage) -> Result<(), IngestError>;

    /// Whether the underlying connection is currently usable.
    async fn is_healthy(&self) -> bool;
}

/// How a transport should settle a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject without requeue.
    Reject,
}

/// Drives one message through the job lifecycle.
pub struct MessageHandler {
    jobs: Arc<dyn JobStore>,
    processor: JobProcessor,
}

impl MessageHandler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        catalog: Arc<dyn CatalogStore>,
        settings: ProcessingConfig,
    ) -> Self {
        Self {
            jobs,
            processor: JobProcessor::new(catalog, settings),
        }
    }

    /// Deserializes and processes a raw message body. Undecodable bodies are
    /// poison messages and are rejected without touching any job.
    pub async fn handle(&self, body: &[u8]) -> Disposition {
        match serde_json::from_slice::<ProcessingMessage>(body) {
            Ok(message) => self.handle_message(&message).await,
            Err(err) => {
                tracing::error!(error = %err, bytes = body.len(), "undecodable message");
                Disposition::Reject
            }
        }
    }

    pub async fn handle_message(&self, message: &ProcessingMessage) -> Disposition {
        let job_id = message.job_id.as_str();

        match self.jobs.start_job(job_id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => return self.skip_unstartable(job_id).await,
            Err(err) => {
                tracing::error!(job_id, error = %err, "could not mark job processing");
                return Disposition::Reject;
            }
        }
        tracing::info!(job_id, file_name = %message.file_name, "job started");

        let reporter = JobProgress::new(self.jobs.clone(), job_id);
        let result = match self
            .processor
            .process(&message.csv_content, job_id, &reporter)
            .await
        {
            Ok(result) => result,
            Err(err) => return self.fail(job_id, &err.to_string()).await,
        };

        match self.jobs.complete_job(job_id, &result, Utc::now()).await {
            Ok(true) => {
                tracing::info!(
                    job_id,
                    total = result.total_rows,
                    successful = result.successful_rows,
                    failed = result.failed_rows,
                    "job completed"
                );
                Disposition::Ack
            }
            Ok(false) => {
                tracing::warn!(job_id, "job left processing state before completion");
                Disposition::Ack
            }
            Err(err) => self.fail(job_id, &err.to_string()).await,
        }
    }

    async fn skip_unstartable(&self, job_id: &str) -> Disposition {
        match self.jobs.get_job(job_id).await {
            Ok(None) => {
                tracing::warn!(job_id, "message for unknown job");
                Disposition::Reject
            }
            Ok(Some(job)) if job.status.is_terminal() => {
                tracing::info!(job_id, status = %job.status, "job already finished, skipping");
                Disposition::Ack
            }
            Ok(Some(job)) if job.status == JobStatus::Processing => {
                // Redelivered after a worker died mid-job; counters are partial.
                self.fail(job_id, "Processing was interrupted before completion")
                    .await
            }
            Ok(Some(job)) => {
                tracing::warn!(job_id, status = %job.status, "job not startable");
                Disposition::Reject
            }
            Err(err) => {
                tracing::error!(job_id, error = %err, "could not load job");
                Disposition::Reject
            }
        }
    }

    async fn fail(&self, job_id: &str, message: &str) -> Disposition {
        let message = if message.trim().is_empty() {
            "Processing failed"
        } else {
            message
        };
        tracing::error!(job_id, error = message, "job failed");
        if let Err(err) = self.jobs.fail_job(job_id, message, Utc::now()).await {
            tracing::error!(job_id, error = %err, "could not record job failure");
        }
        Disposition::Reject
    }
}
