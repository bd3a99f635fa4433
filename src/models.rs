//! Core data models shared by the pipeline, the stores and the HTTP layer.
//!
//! Collections are always native here (`Vec`, `BTreeMap`). Only the SQLite
//! store encodes them to JSON text columns.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a bulk-upload job.
///
/// `Queued → Processing → {Completed | Failed}` and `Queued → Cancelled`.
/// The three terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Stable numeric code, used for storage and the `?status=` filter.
    pub fn code(self) -> i64 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
            JobStatus::Cancelled => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "Queued",
            JobStatus::Processing => "Processing",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    /// Accepts a status name in any case, or its numeric code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<i64>() {
            return Self::from_code(code).ok_or_else(|| format!("unknown job status code: {}", code));
        }
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job status: {}", s))
    }
}

/// One bulk CSV ingestion attempt and its tracked lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub file_name: String,
    pub status: JobStatus,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub successful_rows: u64,
    pub failed_rows: u64,
    pub errors: Vec<String>,
    pub created_products: Vec<ProductSummary>,
    pub created_categories: Vec<String>,
    pub created_subcategories: Vec<String>,
    pub created_at_utc: DateTime<Utc>,
    pub started_at_utc: Option<DateTime<Utc>>,
    pub completed_at_utc: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub progress_percentage: u8,
    pub file_size_bytes: u64,
    pub uploaded_by: Option<String>,
}

impl Job {
    /// A fresh `Queued` job with a generated identifier and zeroed counters.
    pub fn new_queued(file_name: &str, file_size_bytes: u64, uploaded_by: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.to_string(),
            status: JobStatus::Queued,
            total_rows: 0,
            processed_rows: 0,
            successful_rows: 0,
            failed_rows: 0,
            errors: Vec::new(),
            created_products: Vec::new(),
            created_categories: Vec::new(),
            created_subcategories: Vec::new(),
            created_at_utc: Utc::now(),
            started_at_utc: None,
            completed_at_utc: None,
            error_message: None,
            progress_percentage: 0,
            file_size_bytes,
            uploaded_by,
        }
    }
}

/// `floor(processed / total * 100)`, or 0 when nothing is known yet.
pub fn progress_percentage(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (processed.saturating_mul(100) / total).min(100) as u8
}

/// Message carried on the queue for one job. Field names are part of the
/// wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMessage {
    pub job_id: String,
    pub file_name: String,
    pub csv_content: String,
    pub file_size_bytes: u64,
    pub queued_at_utc: DateTime<Utc>,
    #[serde(default)]
    pub uploaded_by: Option<String>,
}

impl ProcessingMessage {
    pub fn for_job(job: &Job, csv_content: String) -> Self {
        Self {
            job_id: job.id.clone(),
            file_name: job.file_name.clone(),
            csv_content,
            file_size_bytes: job.file_size_bytes,
            queued_at_utc: Utc::now(),
            uploaded_by: job.uploaded_by.clone(),
        }
    }
}

/// A validated CSV data row, ready to become a product.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub original_price: Option<Decimal>,
    pub category_id: String,
    pub subcategory_id: Option<String>,
    pub brand: String,
    pub rating: f64,
    pub review_count: i64,
    pub in_stock: bool,
    pub stock_count: i64,
    pub images: Vec<String>,
    pub features: Vec<String>,
    pub specifications: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub sizes: Option<Vec<String>>,
    pub colors: Option<Vec<String>>,
    pub is_active: bool,
}

impl Default for CandidateRecord {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            price: Decimal::ZERO,
            original_price: None,
            category_id: String::new(),
            subcategory_id: None,
            brand: String::new(),
            rating: 0.0,
            review_count: 0,
            in_stock: true,
            stock_count: 0,
            images: Vec::new(),
            features: Vec::new(),
            specifications: BTreeMap::new(),
            tags: Vec::new(),
            sizes: None,
            colors: None,
            is_active: true,
        }
    }
}

/// A product as persisted, returned after creation for client display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub original_price: Option<Decimal>,
    pub category_id: String,
    pub subcategory_id: Option<String>,
    pub brand: String,
    pub rating: f64,
    pub review_count: i64,
    pub in_stock: bool,
    pub stock_count: i64,
    pub images: Vec<String>,
    pub features: Vec<String>,
    pub specifications: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub sizes: Option<Vec<String>>,
    pub colors: Option<Vec<String>>,
    pub created_at_utc: DateTime<Utc>,
    pub updated_at_utc: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl ProductSummary {
    pub fn from_candidate(record: &CandidateRecord, created_at_utc: DateTime<Utc>) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            price: record.price,
            original_price: record.original_price,
            category_id: record.category_id.clone(),
            subcategory_id: record.subcategory_id.clone(),
            brand: record.brand.clone(),
            rating: record.rating,
            review_count: record.review_count,
            in_stock: record.in_stock,
            stock_count: record.stock_count,
            images: record.images.clone(),
            features: record.features.clone(),
            specifications: record.specifications.clone(),
            tags: record.tags.clone(),
            sizes: record.sizes.clone(),
            colors: record.colors.clone(),
            created_at_utc,
            updated_at_utc: None,
            is_active: record.is_active,
        }
    }
}

/// Auto-created parent category.
#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub description: String,
    pub image: String,
    pub is_active: bool,
    pub sort_order: i64,
    pub created_at_utc: DateTime<Utc>,
}

/// Auto-created subcategory under a [`Category`].
#[derive(Debug, Clone, PartialEq)]
pub struct Subcategory {
    pub id: String,
    pub name: String,
    pub description: String,
    pub image: Option<String>,
    pub category_id: String,
    pub is_active: bool,
    pub sort_order: i64,
    pub created_at_utc: DateTime<Utc>,
}

/// Cumulative counters emitted by the processor while a job runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub total_rows: u64,
    pub processed_rows: u64,
    pub successful_rows: u64,
    pub failed_rows: u64,
    pub errors: Vec<String>,
}

impl ProgressSnapshot {
    pub fn percentage(&self) -> u8 {
        progress_percentage(self.processed_rows, self.total_rows)
    }
}

/// Outcome of processing one CSV body.
#[derive(Debug, Clone, Default)]
pub struct ProcessingResult {
    pub total_rows: u64,
    pub successful_rows: u64,
    pub failed_rows: u64,
    pub errors: Vec<String>,
    pub created_products: Vec<ProductSummary>,
    pub created_categories: Vec<String>,
    pub created_subcategories: Vec<String>,
}

/// Filter and page for job listings. `page` is 1-based.
#[derive(Debug, Clone)]
pub struct JobQuery {
    pub page: u32,
    pub page_size: u32,
    pub status: Option<JobStatus>,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 10,
            status: None,
        }
    }
}

/// Aggregate counts across all jobs.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total_jobs: u64,
    pub total_products_created: u64,
    pub status_breakdown: BTreeMap<String, u64>,
    pub queued_jobs: u64,
    pub processing_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
}

impl JobStats {
    /// Builds stats from per-status counts and the completed-jobs product sum.
    pub fn from_counts(counts: &[(JobStatus, u64)], total_products_created: u64) -> Self {
        let mut stats = JobStats {
            total_products_created,
            ..Default::default()
        };
        for (status, count) in counts {
            stats.total_jobs += count;
            *stats
                .status_breakdown
                .entry(status.as_str().to_string())
                .or_insert(0) += count;
            match status {
                JobStatus::Queued => stats.queued_jobs += count,
                JobStatus::Processing => stats.processing_jobs += count,
                JobStatus::Completed => stats.completed_jobs += count,
                JobStatus::Failed => stats.failed_jobs += count,
                JobStatus::Cancelled => stats.cancelled_jobs += count,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_state_machine() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Cancelled));
        assert!(!Processing.can_transition_to(Queued));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_parses_name_or_code() {
        assert_eq!("queued".parse::<JobStatus>().unwrap(), JobStatus::Queued);
        assert_eq!("FAILED".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert_eq!("2".parse::<JobStatus>().unwrap(), JobStatus::Completed);
        assert!("9".parse::<JobStatus>().is_err());
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn percentage_floors_and_handles_zero_total() {
        assert_eq!(progress_percentage(0, 0), 0);
        assert_eq!(progress_percentage(1, 3), 33);
        assert_eq!(progress_percentage(2, 3), 66);
        assert_eq!(progress_percentage(3, 3), 100);
    }

    #[test]
    fn message_uses_camel_case_wire_names() {
        let job = Job::new_queued("items.csv", 42, Some("ops".into()));
        let msg = ProcessingMessage::for_job(&job, "id,name\n".into());
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["jobId"], job.id.as_str());
        assert_eq!(value["fileName"], "items.csv");
        assert_eq!(value["fileSizeBytes"], 42);
        assert_eq!(value["uploadedBy"], "ops");
        assert!(value.get("queuedAtUtc").is_some());
        assert!(value.get("csvContent").is_some());
    }

    #[test]
    fn stats_from_counts() {
        let stats = JobStats::from_counts(
            &[(JobStatus::Completed, 2), (JobStatus::Queued, 1)],
            7,
        );
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.completed_jobs, 2);
        assert_eq!(stats.queued_jobs, 1);
        assert_eq!(stats.total_products_created, 7);
        assert_eq!(stats.status_breakdown.get("Completed"), Some(&2));
    }
}
