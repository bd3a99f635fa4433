//! SQLite-backed [`JobStore`] and [`CatalogStore`].
//!
//! This is the only place collection fields are encoded to JSON text and
//! decimals to their string form. Timestamps are stored as fixed-width
//! RFC 3339 strings so lexical order matches chronological order.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{
    CandidateRecord, Category, Job, JobQuery, JobStats, JobStatus, ProcessingResult,
    ProductSummary, ProgressSnapshot, Subcategory,
};

use super::{CatalogStore, JobStore};

/// Longest `error_message` kept on a job row.
const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// SQLite implementation of both store traits over a shared pool.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp in database: {}", value))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: DeserializeOwned>(column: &str, value: &str) -> Result<T> {
    serde_json::from_str(value).with_context(|| format!("invalid JSON in column {}", column))
}

fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let status_code: i64 = row.try_get("status")?;
    let status = JobStatus::from_code(status_code)
        .with_context(|| format!("unknown job status code in database: {}", status_code))?;
    let created_at: String = row.try_get("created_at_utc")?;

    Ok(Job {
        id: row.try_get("id")?,
        file_name: row.try_get("file_name")?,
        status,
        total_rows: row.try_get::<i64, _>("total_rows")? as u64,
        processed_rows: row.try_get::<i64, _>("processed_rows")? as u64,
        successful_rows: row.try_get::<i64, _>("successful_rows")? as u64,
        failed_rows: row.try_get::<i64, _>("failed_rows")? as u64,
        errors: decode("errors", &row.try_get::<String, _>("errors")?)?,
        created_products: decode(
            "created_products",
            &row.try_get::<String, _>("created_products")?,
        )?,
        created_categories: decode(
            "created_categories",
            &row.try_get::<String, _>("created_categories")?,
        )?,
        created_subcategories: decode(
            "created_subcategories",
            &row.try_get::<String, _>("created_subcategories")?,
        )?,
        created_at_utc: parse_ts(&created_at)?,
        started_at_utc: parse_opt_ts(row.try_get("started_at_utc")?)?,
        completed_at_utc: parse_opt_ts(row.try_get("completed_at_utc")?)?,
        error_message: row.try_get("error_message")?,
        progress_percentage: row.try_get::<i64, _>("progress_percentage")?.clamp(0, 100) as u8,
        file_size_bytes: row.try_get::<i64, _>("file_size_bytes")? as u64,
        uploaded_by: row.try_get("uploaded_by")?,
    })
}

fn product_from_row(row: &SqliteRow) -> Result<ProductSummary> {
    let price: String = row.try_get("price")?;
    let original_price: Option<String> = row.try_get("original_price")?;
    let sizes: Option<String> = row.try_get("sizes")?;
    let colors: Option<String> = row.try_get("colors")?;
    let created_at: String = row.try_get("created_at_utc")?;

    Ok(ProductSummary {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        price: Decimal::from_str(&price)?,
        original_price: original_price
            .as_deref()
            .map(Decimal::from_str)
            .transpose()?,
        category_id: row.try_get("category_id")?,
        subcategory_id: row.try_get("subcategory_id")?,
        brand: row.try_get("brand")?,
        rating: row.try_get("rating")?,
        review_count: row.try_get("review_count")?,
        in_stock: row.try_get("in_stock")?,
        stock_count: row.try_get("stock_count")?,
        images: decode("images", &row.try_get::<String, _>("images")?)?,
        features: decode("features", &row.try_get::<String, _>("features")?)?,
        specifications: decode::<BTreeMap<String, String>>(
            "specifications",
            &row.try_get::<String, _>("specifications")?,
        )?,
        tags: decode("tags", &row.try_get::<String, _>("tags")?)?,
        sizes: sizes.as_deref().map(|s| decode("sizes", s)).transpose()?,
        colors: colors.as_deref().map(|s| decode("colors", s)).transpose()?,
        created_at_utc: parse_ts(&created_at)?,
        updated_at_utc: parse_opt_ts(row.try_get("updated_at_utc")?)?,
        is_active: row.try_get("is_active")?,
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, file_name, status, total_rows, processed_rows,
                              successful_rows, failed_rows, errors, created_products,
                              created_categories, created_subcategories, created_at_utc,
                              started_at_utc, completed_at_utc, error_message,
                              progress_percentage, file_size_bytes, uploaded_by)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.file_name)
        .bind(job.status.code())
        .bind(job.total_rows as i64)
        .bind(job.processed_rows as i64)
        .bind(job.successful_rows as i64)
        .bind(job.failed_rows as i64)
        .bind(encode(&job.errors)?)
        .bind(encode(&job.created_products)?)
        .bind(encode(&job.created_categories)?)
        .bind(encode(&job.created_subcategories)?)
        .bind(ts(job.created_at_utc))
        .bind(job.started_at_utc.map(ts))
        .bind(job.completed_at_utc.map(ts))
        .bind(job.error_message.as_deref().map(truncate_message))
        .bind(job.progress_percentage as i64)
        .bind(job.file_size_bytes as i64)
        .bind(&job.uploaded_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<(Vec<Job>, u64)> {
        let status = query.status.map(JobStatus::code);
        let offset = (query.page.saturating_sub(1) as i64) * query.page_size as i64;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE (? IS NULL OR status = ?)",
        )
        .bind(status)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE (? IS NULL OR status = ?)
            ORDER BY created_at_utc DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(query.page_size as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
        Ok((jobs, total as u64))
    }

    async fn start_job(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, started_at_utc = COALESCE(started_at_utc, ?)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Processing.code())
        .bind(ts(at))
        .bind(id)
        .bind(JobStatus::Queued.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_progress(&self, id: &str, snapshot: &ProgressSnapshot) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET total_rows = ?, processed_rows = ?, successful_rows = ?, failed_rows = ?,
                errors = ?, progress_percentage = MAX(progress_percentage, ?)
            WHERE id = ? AND status = ? AND processed_rows <= ?
            "#,
        )
        .bind(snapshot.total_rows as i64)
        .bind(snapshot.processed_rows as i64)
        .bind(snapshot.successful_rows as i64)
        .bind(snapshot.failed_rows as i64)
        .bind(encode(&snapshot.errors)?)
        .bind(snapshot.percentage() as i64)
        .bind(id)
        .bind(JobStatus::Processing.code())
        .bind(snapshot.processed_rows as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_job(
        &self,
        id: &str,
        result: &ProcessingResult,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, total_rows = ?, processed_rows = ?, successful_rows = ?,
                failed_rows = ?, errors = ?, created_products = ?, created_categories = ?,
                created_subcategories = ?, progress_percentage = 100, completed_at_utc = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Completed.code())
        .bind(result.total_rows as i64)
        .bind(result.total_rows as i64)
        .bind(result.successful_rows as i64)
        .bind(result.failed_rows as i64)
        .bind(encode(&result.errors)?)
        .bind(encode(&result.created_products)?)
        .bind(encode(&result.created_categories)?)
        .bind(encode(&result.created_subcategories)?)
        .bind(ts(at))
        .bind(id)
        .bind(JobStatus::Processing.code())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn fail_job(&self, id: &str, message: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, error_message = ?, completed_at_utc = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Failed.code())
        .bind(truncate_message(message))
        .bind(ts(at))
        .bind(id)
        .bind(JobStatus::Processing.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel_job(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, completed_at_utc = ? WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Cancelled.code())
        .bind(ts(at))
        .bind(id)
        .bind(JobStatus::Queued.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn job_stats(&self) -> Result<JobStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let code: i64 = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            if let Some(status) = JobStatus::from_code(code) {
                counts.push((status, n as u64));
            }
        }

        let products: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(successful_rows), 0) FROM jobs WHERE status = ?",
        )
        .bind(JobStatus::Completed.code())
        .fetch_one(&self.pool)
        .await?;

        Ok(JobStats::from_counts(&counts, products as u64))
    }
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn get_category(&self, id: &str) -> Result<Option<Category>> {
        let row = sqlx::query(
            "SELECT id, name, description, image, is_active, sort_order, created_at_utc \
             FROM categories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let created_at: String = row.try_get("created_at_utc")?;
        Ok(Some(Category {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            image: row.try_get("image")?,
            is_active: row.try_get("is_active")?,
            sort_order: row.try_get("sort_order")?,
            created_at_utc: parse_ts(&created_at)?,
        }))
    }

    async fn insert_category(&self, category: &Category) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO categories (id, name, description, image, is_active, sort_order, created_at_utc)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&category.id)
        .bind(&category.name)
        .bind(&category.description)
        .bind(&category.image)
        .bind(category.is_active)
        .bind(category.sort_order)
        .bind(ts(category.created_at_utc))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_subcategory(&self, id: &str) -> Result<Option<Subcategory>> {
        let row = sqlx::query(
            "SELECT id, name, description, image, category_id, is_active, sort_order, \
             created_at_utc FROM subcategories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let created_at: String = row.try_get("created_at_utc")?;
        Ok(Some(Subcategory {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            image: row.try_get("image")?,
            category_id: row.try_get("category_id")?,
            is_active: row.try_get("is_active")?,
            sort_order: row.try_get("sort_order")?,
            created_at_utc: parse_ts(&created_at)?,
        }))
    }

    async fn insert_subcategory(&self, subcategory: &Subcategory) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO subcategories (id, name, description, image, category_id, is_active,
                                       sort_order, created_at_utc)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&subcategory.id)
        .bind(&subcategory.name)
        .bind(&subcategory.description)
        .bind(&subcategory.image)
        .bind(&subcategory.category_id)
        .bind(subcategory.is_active)
        .bind(subcategory.sort_order)
        .bind(ts(subcategory.created_at_utc))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_product(&self, id: &str) -> Result<Option<ProductSummary>> {
        let row = sqlx::query("SELECT * FROM products WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn insert_product(
        &self,
        record: &CandidateRecord,
        at: DateTime<Utc>,
    ) -> Result<ProductSummary> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, description, price, original_price, category_id,
                                  subcategory_id, brand, rating, review_count, in_stock,
                                  stock_count, images, features, specifications, tags,
                                  sizes, colors, created_at_utc, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(record.price.to_string())
        .bind(record.original_price.map(|p| p.to_string()))
        .bind(&record.category_id)
        .bind(&record.subcategory_id)
        .bind(&record.brand)
        .bind(record.rating)
        .bind(record.review_count)
        .bind(record.in_stock)
        .bind(record.stock_count)
        .bind(encode(&record.images)?)
        .bind(encode(&record.features)?)
        .bind(encode(&record.specifications)?)
        .bind(encode(&record.tags)?)
        .bind(record.sizes.as_ref().map(encode).transpose()?)
        .bind(record.colors.as_ref().map(encode).transpose()?)
        .bind(ts(at))
        .bind(record.is_active)
        .execute(&self.pool)
        .await?;

        self.get_product(&record.id)
            .await?
            .with_context(|| format!("product {} missing after insert", record.id))
    }
}
