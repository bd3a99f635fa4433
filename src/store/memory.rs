//! In-memory [`JobStore`] and [`CatalogStore`] for tests and the `local`
//! broker mode.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. No guard is held across an
//! await point.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    CandidateRecord, Category, Job, JobQuery, JobStats, JobStatus, ProcessingResult,
    ProductSummary, ProgressSnapshot, Subcategory,
};

use super::{CatalogStore, JobStore};

/// In-memory store for testing and single-process deployments.
pub struct InMemoryStore {
    jobs: RwLock<HashMap<String, Job>>,
    categories: RwLock<HashMap<String, Category>>,
    subcategories: RwLock<HashMap<String, Subcategory>>,
    products: RwLock<HashMap<String, ProductSummary>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            categories: RwLock::new(HashMap::new()),
            subcategories: RwLock::new(HashMap::new()),
            products: RwLock::new(HashMap::new()),
        }
    }

    pub fn category_count(&self) -> usize {
        self.categories.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn product_count(&self) -> usize {
        self.products.read().map(|p| p.len()).unwrap_or(0)
    }

    /// Runs `apply` on the job if it is currently in `from`.
    /// Moves a job to `to` if its current status allows it, then applies
    /// the remaining field updates.
    fn transition(&self, id: &str, to: JobStatus, apply: impl FnOnce(&mut Job)) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        match jobs.get_mut(id) {
            Some(job) if job.status.can_transition_to(to) => {
                job.status = to;
                apply(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            bail!("UNIQUE constraint failed: jobs.id");
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(id).cloned())
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<(Vec<Job>, u64)> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut matching: Vec<&Job> = jobs
            .values()
            .filter(|job| query.status.map_or(true, |s| job.status == s))
            .collect();
        matching.sort_by(|a, b| {
            b.created_at_utc
                .cmp(&a.created_at_utc)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total = matching.len() as u64;
        let offset = (query.page.saturating_sub(1) as usize) * query.page_size as usize;
        let page = matching
            .into_iter()
            .skip(offset)
            .take(query.page_size as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn start_job(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.transition(id, JobStatus::Processing, |job| {
            job.started_at_utc.get_or_insert(at);
        })
    }

    async fn update_progress(&self, id: &str, snapshot: &ProgressSnapshot) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing || snapshot.processed_rows < job.processed_rows {
            return Ok(false);
        }
        job.total_rows = snapshot.total_rows;
        job.processed_rows = snapshot.processed_rows;
        job.successful_rows = snapshot.successful_rows;
        job.failed_rows = snapshot.failed_rows;
        job.errors = snapshot.errors.clone();
        job.progress_percentage = job.progress_percentage.max(snapshot.percentage());
        Ok(true)
    }

    async fn complete_job(
        &self,
        id: &str,
        result: &ProcessingResult,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.transition(id, JobStatus::Completed, |job| {
            job.total_rows = result.total_rows;
            job.processed_rows = result.total_rows;
            job.successful_rows = result.successful_rows;
            job.failed_rows = result.failed_rows;
            job.errors = result.errors.clone();
            job.created_products = result.created_products.clone();
            job.created_categories = result.created_categories.clone();
            job.created_subcategories = result.created_subcategories.clone();
            job.progress_percentage = 100;
            job.completed_at_utc = Some(at);
        })
    }

    async fn fail_job(&self, id: &str, message: &str, at: DateTime<Utc>) -> Result<bool> {
        self.transition(id, JobStatus::Failed, |job| {
            job.error_message = Some(message.to_string());
            job.completed_at_utc = Some(at);
        })
    }

    async fn cancel_job(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.transition(id, JobStatus::Cancelled, |job| {
            job.completed_at_utc = Some(at);
        })
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        Ok(jobs.remove(id).is_some())
    }

    async fn job_stats(&self) -> Result<JobStats> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut counts: Vec<(JobStatus, u64)> = Vec::new();
        for status in JobStatus::ALL {
            let n = jobs.values().filter(|j| j.status == status).count() as u64;
            if n > 0 {
                counts.push((status, n));
            }
        }
        let products: u64 = jobs
            .values()
            .filter(|j| j.status == JobStatus::Completed)
            .map(|j| j.successful_rows)
            .sum();
        Ok(JobStats::from_counts(&counts, products))
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn get_category(&self, id: &str) -> Result<Option<Category>> {
        let categories = self.categories.read().map_err(|_| poisoned())?;
        Ok(categories.get(id).cloned())
    }

    async fn insert_category(&self, category: &Category) -> Result<bool> {
        let mut categories = self.categories.write().map_err(|_| poisoned())?;
        if categories.contains_key(&category.id) {
            return Ok(false);
        }
        categories.insert(category.id.clone(), category.clone());
        Ok(true)
    }

    async fn get_subcategory(&self, id: &str) -> Result<Option<Subcategory>> {
        let subcategories = self.subcategories.read().map_err(|_| poisoned())?;
        Ok(subcategories.get(id).cloned())
    }

    async fn insert_subcategory(&self, subcategory: &Subcategory) -> Result<bool> {
        let categories = self.categories.read().map_err(|_| poisoned())?;
        if !categories.contains_key(&subcategory.category_id) {
            bail!("FOREIGN KEY constraint failed: subcategories.category_id");
        }
        let mut subcategories = self.subcategories.write().map_err(|_| poisoned())?;
        if subcategories.contains_key(&subcategory.id) {
            return Ok(false);
        }
        subcategories.insert(subcategory.id.clone(), subcategory.clone());
        Ok(true)
    }

    async fn get_product(&self, id: &str) -> Result<Option<ProductSummary>> {
        let products = self.products.read().map_err(|_| poisoned())?;
        Ok(products.get(id).cloned())
    }

    async fn insert_product(
        &self,
        record: &CandidateRecord,
        at: DateTime<Utc>,
    ) -> Result<ProductSummary> {
        let mut products = self.products.write().map_err(|_| poisoned())?;
        if products.contains_key(&record.id) {
            bail!("UNIQUE constraint failed: products.id");
        }
        let summary = ProductSummary::from_candidate(record, at);
        products.insert(record.id.clone(), summary.clone());
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(total: u64, processed: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            total_rows: total,
            processed_rows: processed,
            successful_rows: processed,
            failed_rows: 0,
            errors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn terminal_jobs_are_not_rewritten() {
        let store = InMemoryStore::new();
        let job = Job::new_queued("a.csv", 10, None);
        store.insert_job(&job).await.unwrap();

        assert!(store.start_job(&job.id, Utc::now()).await.unwrap());
        assert!(!store.start_job(&job.id, Utc::now()).await.unwrap());
        assert!(store.fail_job(&job.id, "boom", Utc::now()).await.unwrap());

        let result = ProcessingResult::default();
        assert!(!store.complete_job(&job.id, &result, Utc::now()).await.unwrap());
        assert!(!store.cancel_job(&job.id, Utc::now()).await.unwrap());
        assert!(!store.update_progress(&job.id, &snapshot(5, 5)).await.unwrap());

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
        assert!(stored.completed_at_utc.is_some());
    }

    #[tokio::test]
    async fn queued_job_cannot_skip_processing() {
        let store = InMemoryStore::new();
        let job = Job::new_queued("a.csv", 10, None);
        store.insert_job(&job).await.unwrap();

        let result = ProcessingResult::default();
        assert!(!store.complete_job(&job.id, &result, Utc::now()).await.unwrap());
        assert!(!store.fail_job(&job.id, "boom", Utc::now()).await.unwrap());
        assert!(store.cancel_job(&job.id, Utc::now()).await.unwrap());
        assert!(!store.start_job(&job.id, Utc::now()).await.unwrap());

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.started_at_utc.is_none());
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn progress_never_moves_backwards() {
        let store = InMemoryStore::new();
        let job = Job::new_queued("a.csv", 10, None);
        store.insert_job(&job).await.unwrap();
        store.start_job(&job.id, Utc::now()).await.unwrap();

        assert!(store.update_progress(&job.id, &snapshot(20, 10)).await.unwrap());
        assert!(!store.update_progress(&job.id, &snapshot(20, 5)).await.unwrap());

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.processed_rows, 10);
        assert_eq!(stored.progress_percentage, 50);
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paged() {
        let store = InMemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut job = Job::new_queued(&format!("{}.csv", i), 1, None);
            job.created_at_utc = Utc::now() + chrono::Duration::seconds(i);
            ids.push(job.id.clone());
            store.insert_job(&job).await.unwrap();
        }

        let query = JobQuery {
            page: 2,
            page_size: 2,
            status: None,
        };
        let (page, total) = store.list_jobs(&query).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[2]);
        assert_eq!(page[1].id, ids[1]);
    }

    #[tokio::test]
    async fn subcategory_requires_parent() {
        let store = InMemoryStore::new();
        let sub = Subcategory {
            id: "s".into(),
            name: "s".into(),
            description: String::new(),
            image: None,
            category_id: "missing".into(),
            is_active: true,
            sort_order: 0,
            created_at_utc: Utc::now(),
        };
        assert!(store.insert_subcategory(&sub).await.is_err());
    }
}
