//! Job progress reporting.
//!
//! The processor calls [`ProgressReporter::report`] every
//! `progress_every_rows` processed rows and once more on the last row, with
//! cumulative counts. Snapshots arrive in non-decreasing `processed_rows`
//! order.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::ProgressSnapshot;
use crate::store::JobStore;

/// Receives progress snapshots from the processor.
///
/// An error is fatal to the job: the processor stops and propagates it.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, snapshot: &ProgressSnapshot) -> Result<()>;
}

/// Discards all snapshots.
pub struct NoProgress;

#[async_trait]
impl ProgressReporter for NoProgress {
    async fn report(&self, _snapshot: &ProgressSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Writes each snapshot onto the job row so pollers see live counters.
pub struct JobProgress {
    store: Arc<dyn JobStore>,
    job_id: String,
}

impl JobProgress {
    pub fn new(store: Arc<dyn JobStore>, job_id: &str) -> Self {
        Self {
            store,
            job_id: job_id.to_string(),
        }
    }
}

#[async_trait]
impl ProgressReporter for JobProgress {
    async fn report(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        let applied = self.store.update_progress(&self.job_id, snapshot).await?;
        tracing::debug!(
            job_id = %self.job_id,
            processed = snapshot.processed_rows,
            total = snapshot.total_rows,
            percent = snapshot.percentage(),
            applied,
            "progress"
        );
        Ok(())
    }
}

/// Keeps every snapshot in memory. Used by tests to inspect the sequence.
#[derive(Default)]
pub struct RecordingProgress {
    snapshots: Mutex<Vec<ProgressSnapshot>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.snapshots
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProgressReporter for RecordingProgress {
    async fn report(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.push(snapshot.clone());
        }
        Ok(())
    }
}
