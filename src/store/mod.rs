//! Storage abstraction for the ingestion pipeline.
//!
//! Two traits split the persistence surface:
//!
//! - [`JobStore`] is the job record store. It owns job lifecycle writes and
//!   enforces the status state machine with conditional updates, so a
//!   terminal job is never rewritten and progress never moves backwards.
//! - [`CatalogStore`] is the catalog datastore the materializer writes
//!   categories, subcategories and products into.
//!
//! [`sqlite::SqliteStore`] and [`memory::InMemoryStore`] implement both.
//! Implementations must be `Send + Sync` to be shared across tasks.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    CandidateRecord, Category, Job, JobQuery, JobStats, ProcessingResult, ProductSummary,
    ProgressSnapshot, Subcategory,
};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Durable job records.
///
/// Transition methods return `Ok(false)` when the job does not exist or is
/// not in the required source state; callers re-read the job to tell the two
/// apart.
///
/// | Method | Transition |
/// |--------|------------|
/// | [`start_job`](JobStore::start_job) | `Queued → Processing` |
/// | [`complete_job`](JobStore::complete_job) | `Processing → Completed` |
/// | [`fail_job`](JobStore::fail_job) | `Processing → Failed` |
/// | [`cancel_job`](JobStore::cancel_job) | `Queued → Cancelled` |
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    /// One page of jobs, newest first, plus the total matching count.
    async fn list_jobs(&self, query: &JobQuery) -> Result<(Vec<Job>, u64)>;

    /// Moves a queued job to `Processing`, setting the start time if unset.
    async fn start_job(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Applies a progress snapshot to a processing job.
    ///
    /// Ignored unless the job is `Processing` and the snapshot has not fewer
    /// processed rows than what is already stored.
    async fn update_progress(&self, id: &str, snapshot: &ProgressSnapshot) -> Result<bool>;

    /// Persists the final result: counters, errors, created entities,
    /// `processed = total` and 100% progress.
    async fn complete_job(
        &self,
        id: &str,
        result: &ProcessingResult,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn fail_job(&self, id: &str, message: &str, at: DateTime<Utc>) -> Result<bool>;

    async fn cancel_job(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Removes the row regardless of status. Returns whether a row existed.
    async fn delete_job(&self, id: &str) -> Result<bool>;

    async fn job_stats(&self) -> Result<JobStats>;
}

/// Catalog entities written by the materializer.
///
/// `insert_*` methods are insert-if-absent: they return `Ok(false)` instead
/// of failing when the identifier already exists.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_category(&self, id: &str) -> Result<Option<Category>>;

    async fn insert_category(&self, category: &Category) -> Result<bool>;

    async fn get_subcategory(&self, id: &str) -> Result<Option<Subcategory>>;

    async fn insert_subcategory(&self, subcategory: &Subcategory) -> Result<bool>;

    async fn get_product(&self, id: &str) -> Result<Option<ProductSummary>>;

    /// Inserts a product and returns it as persisted.
    ///
    /// Fails if the identifier already exists.
    async fn insert_product(
        &self,
        record: &CandidateRecord,
        at: DateTime<Utc>,
    ) -> Result<ProductSummary>;

    async fn category_exists(&self, id: &str) -> Result<bool> {
        Ok(self.get_category(id).await?.is_some())
    }

    async fn product_exists(&self, id: &str) -> Result<bool> {
        Ok(self.get_product(id).await?.is_some())
    }
}
